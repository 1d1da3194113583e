use bytes::Bytes;

/// Start field on the wire: `05 64` (0x6405 read little-endian).
pub const START_BYTES: [u8; 2] = [0x05, 0x64];
pub const START_FIELD: u16 = 0x6405;

/// The length byte counts control + destination + source + user data.
pub const MIN_LENGTH_BYTE: u8 = 5;
/// Header (10) + 250 data bytes + 16 block CRCs.
pub const MAX_FRAME_SIZE: usize = 292;
pub const MAX_FRAME_DATA: usize = 250;
pub const HEADER_SIZE: usize = 10;
pub const BLOCK_SIZE: usize = 16;

pub const CONTROL_DIR: u8 = 0x80;
pub const CONTROL_PRM: u8 = 0x40;
pub const CONTROL_FCB: u8 = 0x20;
pub const CONTROL_FCV: u8 = 0x10;
pub const CONTROL_DFC: u8 = 0x10;

/// Link-layer function codes. The primary set travels with PRM=1, the
/// secondary set with PRM=0; the same nibble value means different things in
/// each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFunction {
    // Primary (PRM = 1)
    ResetLinkStates,
    TestLinkStates,
    ConfirmedUserData,
    UnconfirmedUserData,
    RequestLinkStatus,
    // Secondary (PRM = 0)
    Ack,
    Nack,
    LinkStatus,
    NotSupported,
}

impl LinkFunction {
    pub fn code(self) -> u8 {
        match self {
            LinkFunction::ResetLinkStates => 0,
            LinkFunction::TestLinkStates => 2,
            LinkFunction::ConfirmedUserData => 3,
            LinkFunction::UnconfirmedUserData => 4,
            LinkFunction::RequestLinkStatus => 9,
            LinkFunction::Ack => 0,
            LinkFunction::Nack => 1,
            LinkFunction::LinkStatus => 11,
            LinkFunction::NotSupported => 15,
        }
    }

    pub fn is_primary(self) -> bool {
        matches!(
            self,
            LinkFunction::ResetLinkStates
                | LinkFunction::TestLinkStates
                | LinkFunction::ConfirmedUserData
                | LinkFunction::UnconfirmedUserData
                | LinkFunction::RequestLinkStatus
        )
    }

    /// Resolve the function nibble through the table selected by the PRM bit.
    pub fn from_control(control: u8) -> Option<Self> {
        let code = control & 0x0F;
        if control & CONTROL_PRM != 0 {
            match code {
                0 => Some(LinkFunction::ResetLinkStates),
                2 => Some(LinkFunction::TestLinkStates),
                3 => Some(LinkFunction::ConfirmedUserData),
                4 => Some(LinkFunction::UnconfirmedUserData),
                9 => Some(LinkFunction::RequestLinkStatus),
                _ => None,
            }
        } else {
            match code {
                0 => Some(LinkFunction::Ack),
                1 => Some(LinkFunction::Nack),
                11 => Some(LinkFunction::LinkStatus),
                15 => Some(LinkFunction::NotSupported),
                _ => None,
            }
        }
    }

    pub fn carries_user_data(self) -> bool {
        matches!(
            self,
            LinkFunction::ConfirmedUserData | LinkFunction::UnconfirmedUserData
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub function: LinkFunction,
    pub destination: u16,
    pub source: u16,
    /// DIR bit: set on every frame originating from a master.
    pub from_master: bool,
    /// FCB (primary frames only).
    pub frame_count_bit: bool,
    /// FCV (primary frames only).
    pub frame_count_valid: bool,
    /// DFC (secondary frames only).
    pub data_flow_control: bool,
}

impl FrameHeader {
    pub fn control(&self) -> u8 {
        let mut control = self.function.code();
        if self.from_master {
            control |= CONTROL_DIR;
        }
        if self.function.is_primary() {
            control |= CONTROL_PRM;
            if self.frame_count_bit {
                control |= CONTROL_FCB;
            }
            if self.frame_count_valid {
                control |= CONTROL_FCV;
            }
        } else if self.data_flow_control {
            control |= CONTROL_DFC;
        }
        control
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub data: Bytes,
}

impl Frame {
    fn control_frame(
        function: LinkFunction,
        destination: u16,
        source: u16,
        from_master: bool,
    ) -> Self {
        Frame {
            header: FrameHeader {
                function,
                destination,
                source,
                from_master,
                frame_count_bit: false,
                frame_count_valid: false,
                data_flow_control: false,
            },
            data: Bytes::new(),
        }
    }

    pub fn unconfirmed_user_data(
        destination: u16,
        source: u16,
        from_master: bool,
        data: Bytes,
    ) -> Self {
        Frame {
            header: FrameHeader {
                function: LinkFunction::UnconfirmedUserData,
                destination,
                source,
                from_master,
                frame_count_bit: false,
                frame_count_valid: false,
                data_flow_control: false,
            },
            data,
        }
    }

    pub fn confirmed_user_data(
        destination: u16,
        source: u16,
        from_master: bool,
        fcb: bool,
        data: Bytes,
    ) -> Self {
        Frame {
            header: FrameHeader {
                function: LinkFunction::ConfirmedUserData,
                destination,
                source,
                from_master,
                frame_count_bit: fcb,
                frame_count_valid: true,
                data_flow_control: false,
            },
            data,
        }
    }

    pub fn reset_link_states(destination: u16, source: u16, from_master: bool) -> Self {
        Self::control_frame(LinkFunction::ResetLinkStates, destination, source, from_master)
    }

    pub fn test_link_states(destination: u16, source: u16, from_master: bool, fcb: bool) -> Self {
        Frame {
            header: FrameHeader {
                function: LinkFunction::TestLinkStates,
                destination,
                source,
                from_master,
                frame_count_bit: fcb,
                frame_count_valid: true,
                data_flow_control: false,
            },
            data: Bytes::new(),
        }
    }

    pub fn request_link_status(destination: u16, source: u16, from_master: bool) -> Self {
        Self::control_frame(LinkFunction::RequestLinkStatus, destination, source, from_master)
    }

    pub fn ack(destination: u16, source: u16, from_master: bool) -> Self {
        Self::control_frame(LinkFunction::Ack, destination, source, from_master)
    }

    pub fn nack(destination: u16, source: u16, from_master: bool) -> Self {
        Self::control_frame(LinkFunction::Nack, destination, source, from_master)
    }

    pub fn link_status(destination: u16, source: u16, from_master: bool) -> Self {
        Self::control_frame(LinkFunction::LinkStatus, destination, source, from_master)
    }

    pub fn not_supported(destination: u16, source: u16, from_master: bool) -> Self {
        Self::control_frame(LinkFunction::NotSupported, destination, source, from_master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_for_master_reset() {
        // S1: master reset link states, dst=1 src=2 -> control 0xC0
        let frame = Frame::reset_link_states(1, 2, true);
        assert_eq!(frame.header.control(), 0xC0);
    }

    #[test]
    fn control_byte_for_outstation_ack() {
        let frame = Frame::ack(2, 1, false);
        assert_eq!(frame.header.control(), 0x00);
    }

    #[test]
    fn function_table_depends_on_prm() {
        // Nibble 0 is RESET_LINK_STATES with PRM set, ACK without.
        assert_eq!(
            LinkFunction::from_control(0xC0),
            Some(LinkFunction::ResetLinkStates)
        );
        assert_eq!(LinkFunction::from_control(0x00), Some(LinkFunction::Ack));
        assert_eq!(LinkFunction::from_control(0x45), None);
        assert_eq!(LinkFunction::from_control(0x0B), Some(LinkFunction::LinkStatus));
    }

    #[test]
    fn confirmed_user_data_sets_fcv() {
        let frame = Frame::confirmed_user_data(10, 20, false, true, Bytes::from_static(b"x"));
        let control = frame.header.control();
        assert_eq!(control & CONTROL_PRM, CONTROL_PRM);
        assert_eq!(control & CONTROL_FCB, CONTROL_FCB);
        assert_eq!(control & CONTROL_FCV, CONTROL_FCV);
        assert_eq!(control & CONTROL_DIR, 0);
    }
}
