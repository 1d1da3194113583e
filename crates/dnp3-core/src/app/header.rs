use crate::error::ProtocolError;

const AC_FIR: u8 = 0x80;
const AC_FIN: u8 = 0x40;
const AC_CON: u8 = 0x20;
const AC_UNS: u8 = 0x10;
const AC_SEQ_MASK: u8 = 0x0F;

/// Application control octet: FIR/FIN/CON/UNS plus a 4-bit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppControl {
    pub fir: bool,
    pub fin: bool,
    pub con: bool,
    pub uns: bool,
    pub seq: u8,
}

impl AppControl {
    pub fn single(seq: u8) -> Self {
        Self {
            fir: true,
            fin: true,
            con: false,
            uns: false,
            seq: seq & AC_SEQ_MASK,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fir: byte & AC_FIR != 0,
            fin: byte & AC_FIN != 0,
            con: byte & AC_CON != 0,
            uns: byte & AC_UNS != 0,
            seq: byte & AC_SEQ_MASK,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.seq & AC_SEQ_MASK;
        if self.fir {
            byte |= AC_FIR;
        }
        if self.fin {
            byte |= AC_FIN;
        }
        if self.con {
            byte |= AC_CON;
        }
        if self.uns {
            byte |= AC_UNS;
        }
        byte
    }
}

/// Application-layer function codes, the closed DNP3 enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    Confirm,
    Read,
    Write,
    Select,
    Operate,
    DirectOperate,
    DirectOperateNr,
    ImmedFreeze,
    ImmedFreezeNr,
    FreezeClear,
    FreezeClearNr,
    FreezeAtTime,
    FreezeAtTimeNr,
    ColdRestart,
    WarmRestart,
    InitializeData,
    InitializeAppl,
    StartAppl,
    StopAppl,
    SaveConfig,
    EnableUnsolicited,
    DisableUnsolicited,
    AssignClass,
    DelayMeasure,
    RecordCurrentTime,
    OpenFile,
    CloseFile,
    DeleteFile,
    GetFileInfo,
    AuthenticateFile,
    AbortFile,
    ActivateConfig,
    // Secure Authentication hook: recognized on the wire, handed to the
    // embedder unprocessed.
    AuthenticateReq,
    AuthenticateReqNoAck,
    Response,
    UnsolicitedResponse,
    AuthenticateResp,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::Confirm => 0,
            FunctionCode::Read => 1,
            FunctionCode::Write => 2,
            FunctionCode::Select => 3,
            FunctionCode::Operate => 4,
            FunctionCode::DirectOperate => 5,
            FunctionCode::DirectOperateNr => 6,
            FunctionCode::ImmedFreeze => 7,
            FunctionCode::ImmedFreezeNr => 8,
            FunctionCode::FreezeClear => 9,
            FunctionCode::FreezeClearNr => 10,
            FunctionCode::FreezeAtTime => 11,
            FunctionCode::FreezeAtTimeNr => 12,
            FunctionCode::ColdRestart => 13,
            FunctionCode::WarmRestart => 14,
            FunctionCode::InitializeData => 15,
            FunctionCode::InitializeAppl => 16,
            FunctionCode::StartAppl => 17,
            FunctionCode::StopAppl => 18,
            FunctionCode::SaveConfig => 19,
            FunctionCode::EnableUnsolicited => 20,
            FunctionCode::DisableUnsolicited => 21,
            FunctionCode::AssignClass => 22,
            FunctionCode::DelayMeasure => 23,
            FunctionCode::RecordCurrentTime => 24,
            FunctionCode::OpenFile => 25,
            FunctionCode::CloseFile => 26,
            FunctionCode::DeleteFile => 27,
            FunctionCode::GetFileInfo => 28,
            FunctionCode::AuthenticateFile => 29,
            FunctionCode::AbortFile => 30,
            FunctionCode::ActivateConfig => 31,
            FunctionCode::AuthenticateReq => 32,
            FunctionCode::AuthenticateReqNoAck => 33,
            FunctionCode::Response => 129,
            FunctionCode::UnsolicitedResponse => 130,
            FunctionCode::AuthenticateResp => 131,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        let function = match code {
            0 => FunctionCode::Confirm,
            1 => FunctionCode::Read,
            2 => FunctionCode::Write,
            3 => FunctionCode::Select,
            4 => FunctionCode::Operate,
            5 => FunctionCode::DirectOperate,
            6 => FunctionCode::DirectOperateNr,
            7 => FunctionCode::ImmedFreeze,
            8 => FunctionCode::ImmedFreezeNr,
            9 => FunctionCode::FreezeClear,
            10 => FunctionCode::FreezeClearNr,
            11 => FunctionCode::FreezeAtTime,
            12 => FunctionCode::FreezeAtTimeNr,
            13 => FunctionCode::ColdRestart,
            14 => FunctionCode::WarmRestart,
            15 => FunctionCode::InitializeData,
            16 => FunctionCode::InitializeAppl,
            17 => FunctionCode::StartAppl,
            18 => FunctionCode::StopAppl,
            19 => FunctionCode::SaveConfig,
            20 => FunctionCode::EnableUnsolicited,
            21 => FunctionCode::DisableUnsolicited,
            22 => FunctionCode::AssignClass,
            23 => FunctionCode::DelayMeasure,
            24 => FunctionCode::RecordCurrentTime,
            25 => FunctionCode::OpenFile,
            26 => FunctionCode::CloseFile,
            27 => FunctionCode::DeleteFile,
            28 => FunctionCode::GetFileInfo,
            29 => FunctionCode::AuthenticateFile,
            30 => FunctionCode::AbortFile,
            31 => FunctionCode::ActivateConfig,
            32 => FunctionCode::AuthenticateReq,
            33 => FunctionCode::AuthenticateReqNoAck,
            129 => FunctionCode::Response,
            130 => FunctionCode::UnsolicitedResponse,
            131 => FunctionCode::AuthenticateResp,
            other => return Err(ProtocolError::UnknownFunctionCode(other)),
        };
        Ok(function)
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            FunctionCode::Response
                | FunctionCode::UnsolicitedResponse
                | FunctionCode::AuthenticateResp
        )
    }

    /// Whether object payloads follow the item headers. Reads and most
    /// control requests carry headers with ranges only.
    pub fn needs_values(self) -> bool {
        matches!(
            self,
            FunctionCode::Write
                | FunctionCode::Select
                | FunctionCode::Operate
                | FunctionCode::DirectOperate
                | FunctionCode::DirectOperateNr
                | FunctionCode::FreezeAtTime
                | FunctionCode::FreezeAtTimeNr
                | FunctionCode::Response
                | FunctionCode::UnsolicitedResponse
        )
    }
}

/// Internal indications: 16-bit status field in every response header.
/// IIN1 is the low byte; the field travels little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Iin(pub u16);

impl Iin {
    pub const BROADCAST: u16 = 0x0001;
    pub const CLASS_1_EVENTS: u16 = 0x0002;
    pub const CLASS_2_EVENTS: u16 = 0x0004;
    pub const CLASS_3_EVENTS: u16 = 0x0008;
    pub const NEED_TIME: u16 = 0x0010;
    pub const LOCAL_CONTROL: u16 = 0x0020;
    pub const DEVICE_TROUBLE: u16 = 0x0040;
    pub const DEVICE_RESTART: u16 = 0x0080;
    pub const NO_FUNC_CODE_SUPPORT: u16 = 0x0100;
    pub const OBJECT_UNKNOWN: u16 = 0x0200;
    pub const PARAMETER_ERROR: u16 = 0x0400;
    pub const EVENT_BUFFER_OVERFLOW: u16 = 0x0800;
    pub const ALREADY_EXECUTING: u16 = 0x1000;
    pub const CONFIG_CORRUPT: u16 = 0x2000;
    pub const RESERVED_1: u16 = 0x4000;
    pub const RESERVED_2: u16 = 0x8000;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_set(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    pub fn with(mut self, bit: u16) -> Self {
        self.set(bit);
        self
    }

    pub fn union(self, other: Iin) -> Self {
        Iin(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_control_round_trip() {
        for byte in 0..=u8::MAX {
            assert_eq!(AppControl::from_byte(byte).to_byte(), byte);
        }
    }

    #[test]
    fn function_codes_round_trip() {
        for code in (0..=33).chain(129..=131) {
            let function = FunctionCode::from_code(code).unwrap();
            assert_eq!(function.code(), code);
        }
        assert!(matches!(
            FunctionCode::from_code(64),
            Err(ProtocolError::UnknownFunctionCode(64))
        ));
    }

    #[test]
    fn responses_and_writes_need_values() {
        assert!(FunctionCode::Response.needs_values());
        assert!(FunctionCode::DirectOperate.needs_values());
        assert!(!FunctionCode::Read.needs_values());
        assert!(!FunctionCode::Confirm.needs_values());
    }

    #[test]
    fn iin_bits_accumulate() {
        let mut iin = Iin::new();
        iin.set(Iin::DEVICE_RESTART);
        iin.set(Iin::OBJECT_UNKNOWN);
        assert!(iin.is_set(Iin::DEVICE_RESTART));
        assert!(iin.is_set(Iin::OBJECT_UNKNOWN));
        assert!(!iin.is_set(Iin::NEED_TIME));
        iin.clear(Iin::OBJECT_UNKNOWN);
        assert_eq!(iin.bits(), Iin::DEVICE_RESTART);
    }
}
