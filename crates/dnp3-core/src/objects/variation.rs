/// Serialized size of one object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Fixed(usize),
    /// Bit-packed: the range count selects the number of bits.
    Packed,
    /// Header-only variation; no instances follow.
    None,
}

/// Logical point type a variation maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointType {
    BinaryInput,
    BinaryOutput,
    AnalogInput,
    AnalogOutput,
    Counter,
    Time,
    Class,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariationDescriptor {
    pub size: Size,
    pub has_value: bool,
    pub has_status: bool,
    pub has_timestamp: bool,
    pub is_packed: bool,
    pub point_type: PointType,
}

const fn fixed(
    size: usize,
    has_value: bool,
    has_status: bool,
    has_timestamp: bool,
    point_type: PointType,
) -> VariationDescriptor {
    VariationDescriptor {
        size: Size::Fixed(size),
        has_value,
        has_status,
        has_timestamp,
        is_packed: false,
        point_type,
    }
}

const fn packed(point_type: PointType) -> VariationDescriptor {
    VariationDescriptor {
        size: Size::Packed,
        has_value: true,
        has_status: false,
        has_timestamp: false,
        is_packed: true,
        point_type,
    }
}

const fn header_only(point_type: PointType) -> VariationDescriptor {
    VariationDescriptor {
        size: Size::None,
        has_value: false,
        has_status: false,
        has_timestamp: false,
        is_packed: false,
        point_type,
    }
}

/// The registered (group, variation) pairs. The DNP3 object library defines
/// many more; this set covers the point types the stack serves, and adding a
/// pair means adding an arm here and a codec arm in `instance.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variation {
    BinaryInputPacked,
    BinaryInputFlags,
    BinaryInputEvent,
    BinaryInputEventAbsTime,
    BinaryInputEventRelTime,
    BinaryOutputPacked,
    BinaryOutputStatus,
    ControlRelayOutputBlock,
    Counter32Flag,
    Counter16Flag,
    Counter32,
    Counter16,
    AnalogInput32Flag,
    AnalogInput16Flag,
    AnalogInput32,
    AnalogInput16,
    AnalogInputFloatFlag,
    AnalogInputDoubleFlag,
    AnalogInputEvent32,
    AnalogInputEvent16,
    AnalogInputEventFloat,
    AnalogOutputStatus32,
    AnalogOutputStatus16,
    AnalogOutputStatusFloat,
    AnalogOutputStatusDouble,
    AnalogOutputBlock32,
    AnalogOutputBlock16,
    AnalogOutputBlockFloat,
    AnalogOutputBlockDouble,
    TimeAndDate,
    CtoSynchronized,
    CtoUnsynchronized,
    TimeDelayCoarse,
    TimeDelayFine,
    Class0Data,
    Class1Data,
    Class2Data,
    Class3Data,
    InternalIndicationsPacked,
}

impl Variation {
    pub fn group(self) -> u8 {
        self.group_var().0
    }

    pub fn variation(self) -> u8 {
        self.group_var().1
    }

    pub fn group_var(self) -> (u8, u8) {
        match self {
            Variation::BinaryInputPacked => (1, 1),
            Variation::BinaryInputFlags => (1, 2),
            Variation::BinaryInputEvent => (2, 1),
            Variation::BinaryInputEventAbsTime => (2, 2),
            Variation::BinaryInputEventRelTime => (2, 3),
            Variation::BinaryOutputPacked => (10, 1),
            Variation::BinaryOutputStatus => (10, 2),
            Variation::ControlRelayOutputBlock => (12, 1),
            Variation::Counter32Flag => (20, 1),
            Variation::Counter16Flag => (20, 2),
            Variation::Counter32 => (20, 5),
            Variation::Counter16 => (20, 6),
            Variation::AnalogInput32Flag => (30, 1),
            Variation::AnalogInput16Flag => (30, 2),
            Variation::AnalogInput32 => (30, 3),
            Variation::AnalogInput16 => (30, 4),
            Variation::AnalogInputFloatFlag => (30, 5),
            Variation::AnalogInputDoubleFlag => (30, 6),
            Variation::AnalogInputEvent32 => (32, 1),
            Variation::AnalogInputEvent16 => (32, 2),
            Variation::AnalogInputEventFloat => (32, 5),
            Variation::AnalogOutputStatus32 => (40, 1),
            Variation::AnalogOutputStatus16 => (40, 2),
            Variation::AnalogOutputStatusFloat => (40, 3),
            Variation::AnalogOutputStatusDouble => (40, 4),
            Variation::AnalogOutputBlock32 => (41, 1),
            Variation::AnalogOutputBlock16 => (41, 2),
            Variation::AnalogOutputBlockFloat => (41, 3),
            Variation::AnalogOutputBlockDouble => (41, 4),
            Variation::TimeAndDate => (50, 1),
            Variation::CtoSynchronized => (51, 1),
            Variation::CtoUnsynchronized => (51, 2),
            Variation::TimeDelayCoarse => (52, 1),
            Variation::TimeDelayFine => (52, 2),
            Variation::Class0Data => (60, 1),
            Variation::Class1Data => (60, 2),
            Variation::Class2Data => (60, 3),
            Variation::Class3Data => (60, 4),
            Variation::InternalIndicationsPacked => (80, 1),
        }
    }

    pub fn from_group_var(group: u8, variation: u8) -> Option<Self> {
        let var = match (group, variation) {
            (1, 1) => Variation::BinaryInputPacked,
            (1, 2) => Variation::BinaryInputFlags,
            (2, 1) => Variation::BinaryInputEvent,
            (2, 2) => Variation::BinaryInputEventAbsTime,
            (2, 3) => Variation::BinaryInputEventRelTime,
            (10, 1) => Variation::BinaryOutputPacked,
            (10, 2) => Variation::BinaryOutputStatus,
            (12, 1) => Variation::ControlRelayOutputBlock,
            (20, 1) => Variation::Counter32Flag,
            (20, 2) => Variation::Counter16Flag,
            (20, 5) => Variation::Counter32,
            (20, 6) => Variation::Counter16,
            (30, 1) => Variation::AnalogInput32Flag,
            (30, 2) => Variation::AnalogInput16Flag,
            (30, 3) => Variation::AnalogInput32,
            (30, 4) => Variation::AnalogInput16,
            (30, 5) => Variation::AnalogInputFloatFlag,
            (30, 6) => Variation::AnalogInputDoubleFlag,
            (32, 1) => Variation::AnalogInputEvent32,
            (32, 2) => Variation::AnalogInputEvent16,
            (32, 5) => Variation::AnalogInputEventFloat,
            (40, 1) => Variation::AnalogOutputStatus32,
            (40, 2) => Variation::AnalogOutputStatus16,
            (40, 3) => Variation::AnalogOutputStatusFloat,
            (40, 4) => Variation::AnalogOutputStatusDouble,
            (41, 1) => Variation::AnalogOutputBlock32,
            (41, 2) => Variation::AnalogOutputBlock16,
            (41, 3) => Variation::AnalogOutputBlockFloat,
            (41, 4) => Variation::AnalogOutputBlockDouble,
            (50, 1) => Variation::TimeAndDate,
            (51, 1) => Variation::CtoSynchronized,
            (51, 2) => Variation::CtoUnsynchronized,
            (52, 1) => Variation::TimeDelayCoarse,
            (52, 2) => Variation::TimeDelayFine,
            (60, 1) => Variation::Class0Data,
            (60, 2) => Variation::Class1Data,
            (60, 3) => Variation::Class2Data,
            (60, 4) => Variation::Class3Data,
            (80, 1) => Variation::InternalIndicationsPacked,
            _ => return None,
        };
        Some(var)
    }

    pub fn descriptor(self) -> VariationDescriptor {
        use PointType::*;
        match self {
            Variation::BinaryInputPacked => packed(BinaryInput),
            Variation::BinaryInputFlags => fixed(1, true, true, false, BinaryInput),
            Variation::BinaryInputEvent => fixed(1, true, true, false, BinaryInput),
            Variation::BinaryInputEventAbsTime => fixed(7, true, true, true, BinaryInput),
            Variation::BinaryInputEventRelTime => fixed(3, true, true, true, BinaryInput),
            Variation::BinaryOutputPacked => packed(BinaryOutput),
            Variation::BinaryOutputStatus => fixed(1, true, true, false, BinaryOutput),
            Variation::ControlRelayOutputBlock => fixed(11, true, true, false, BinaryOutput),
            Variation::Counter32Flag => fixed(5, true, true, false, Counter),
            Variation::Counter16Flag => fixed(3, true, true, false, Counter),
            Variation::Counter32 => fixed(4, true, false, false, Counter),
            Variation::Counter16 => fixed(2, true, false, false, Counter),
            Variation::AnalogInput32Flag => fixed(5, true, true, false, AnalogInput),
            Variation::AnalogInput16Flag => fixed(3, true, true, false, AnalogInput),
            Variation::AnalogInput32 => fixed(4, true, false, false, AnalogInput),
            Variation::AnalogInput16 => fixed(2, true, false, false, AnalogInput),
            Variation::AnalogInputFloatFlag => fixed(5, true, true, false, AnalogInput),
            Variation::AnalogInputDoubleFlag => fixed(9, true, true, false, AnalogInput),
            Variation::AnalogInputEvent32 => fixed(5, true, true, false, AnalogInput),
            Variation::AnalogInputEvent16 => fixed(3, true, true, false, AnalogInput),
            Variation::AnalogInputEventFloat => fixed(5, true, true, false, AnalogInput),
            Variation::AnalogOutputStatus32 => fixed(5, true, true, false, AnalogOutput),
            Variation::AnalogOutputStatus16 => fixed(3, true, true, false, AnalogOutput),
            Variation::AnalogOutputStatusFloat => fixed(5, true, true, false, AnalogOutput),
            Variation::AnalogOutputStatusDouble => fixed(9, true, true, false, AnalogOutput),
            Variation::AnalogOutputBlock32 => fixed(5, true, true, false, AnalogOutput),
            Variation::AnalogOutputBlock16 => fixed(3, true, true, false, AnalogOutput),
            Variation::AnalogOutputBlockFloat => fixed(5, true, true, false, AnalogOutput),
            Variation::AnalogOutputBlockDouble => fixed(9, true, true, false, AnalogOutput),
            Variation::TimeAndDate => fixed(6, true, false, true, Time),
            Variation::CtoSynchronized => fixed(6, true, false, true, Time),
            Variation::CtoUnsynchronized => fixed(6, true, false, true, Time),
            Variation::TimeDelayCoarse => fixed(2, true, false, false, Time),
            Variation::TimeDelayFine => fixed(2, true, false, false, Time),
            Variation::Class0Data => header_only(Class),
            Variation::Class1Data => header_only(Class),
            Variation::Class2Data => header_only(Class),
            Variation::Class3Data => header_only(Class),
            Variation::InternalIndicationsPacked => packed(Internal),
        }
    }

    /// Every registered pair, for registry-wide tests.
    pub fn all() -> impl Iterator<Item = Variation> {
        const ALL: [Variation; 39] = [
            Variation::BinaryInputPacked,
            Variation::BinaryInputFlags,
            Variation::BinaryInputEvent,
            Variation::BinaryInputEventAbsTime,
            Variation::BinaryInputEventRelTime,
            Variation::BinaryOutputPacked,
            Variation::BinaryOutputStatus,
            Variation::ControlRelayOutputBlock,
            Variation::Counter32Flag,
            Variation::Counter16Flag,
            Variation::Counter32,
            Variation::Counter16,
            Variation::AnalogInput32Flag,
            Variation::AnalogInput16Flag,
            Variation::AnalogInput32,
            Variation::AnalogInput16,
            Variation::AnalogInputFloatFlag,
            Variation::AnalogInputDoubleFlag,
            Variation::AnalogInputEvent32,
            Variation::AnalogInputEvent16,
            Variation::AnalogInputEventFloat,
            Variation::AnalogOutputStatus32,
            Variation::AnalogOutputStatus16,
            Variation::AnalogOutputStatusFloat,
            Variation::AnalogOutputStatusDouble,
            Variation::AnalogOutputBlock32,
            Variation::AnalogOutputBlock16,
            Variation::AnalogOutputBlockFloat,
            Variation::AnalogOutputBlockDouble,
            Variation::TimeAndDate,
            Variation::CtoSynchronized,
            Variation::CtoUnsynchronized,
            Variation::TimeDelayCoarse,
            Variation::TimeDelayFine,
            Variation::Class0Data,
            Variation::Class1Data,
            Variation::Class2Data,
            Variation::Class3Data,
            Variation::InternalIndicationsPacked,
        ];
        ALL.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_var_round_trip() {
        for variation in Variation::all() {
            let (group, var) = variation.group_var();
            assert_eq!(Variation::from_group_var(group, var), Some(variation));
        }
    }

    #[test]
    fn unknown_pair_unregistered() {
        assert_eq!(Variation::from_group_var(1, 3), None);
        assert_eq!(Variation::from_group_var(121, 1), None);
    }

    #[test]
    fn class_data_is_header_only() {
        for variation in [
            Variation::Class0Data,
            Variation::Class1Data,
            Variation::Class2Data,
            Variation::Class3Data,
        ] {
            assert_eq!(variation.descriptor().size, Size::None);
            assert!(!variation.descriptor().has_value);
        }
    }
}
