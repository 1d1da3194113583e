use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::objects::variation::{Size, Variation};

/// State bit in the flags octet of binary points.
pub const FLAG_STATE: u8 = 0x80;
/// ONLINE quality bit.
pub const FLAG_ONLINE: u8 = 0x01;

/// CROB control codes (operation type field).
pub const CROB_NUL: u8 = 0x00;
pub const CROB_PULSE_ON: u8 = 0x01;
pub const CROB_PULSE_OFF: u8 = 0x02;
pub const CROB_LATCH_ON: u8 = 0x03;
pub const CROB_LATCH_OFF: u8 = 0x04;

/// Point-level value a decoded object maps onto, for the transaction API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Binary(bool),
    Analog(f64),
    Counter(u32),
    Time(u64),
}

/// One decoded object instance. The layout (field order, widths) is selected
/// by the `Variation`; the instance only carries the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjectInstance {
    /// One bit of a packed variation.
    Bit(bool),
    Flags { flags: u8 },
    FlagsAbsTime { flags: u8, time_ms: u64 },
    FlagsRelTime { flags: u8, delta_ms: u16 },
    Crob {
        code: u8,
        count: u8,
        on_time_ms: u32,
        off_time_ms: u32,
        status: u8,
    },
    CounterU32 { value: u32, flags: Option<u8> },
    CounterU16 { value: u16, flags: Option<u8> },
    AnalogI32 { value: i32, flags: Option<u8> },
    AnalogI16 { value: i16, flags: Option<u8> },
    AnalogF32 { value: f32, flags: u8 },
    AnalogF64 { value: f64, flags: u8 },
    TimeMs(u64),
    TimeDelay(u16),
}

impl ObjectInstance {
    pub fn binary(state: bool) -> Self {
        let mut flags = FLAG_ONLINE;
        if state {
            flags |= FLAG_STATE;
        }
        ObjectInstance::Flags { flags }
    }

    pub fn crob(code: u8, on_time_ms: u32, off_time_ms: u32) -> Self {
        ObjectInstance::Crob {
            code,
            count: 1,
            on_time_ms,
            off_time_ms,
            status: 0,
        }
    }

    pub fn as_point_value(&self) -> Option<PointValue> {
        match *self {
            ObjectInstance::Bit(state) => Some(PointValue::Binary(state)),
            ObjectInstance::Flags { flags }
            | ObjectInstance::FlagsAbsTime { flags, .. }
            | ObjectInstance::FlagsRelTime { flags, .. } => {
                Some(PointValue::Binary(flags & FLAG_STATE != 0))
            }
            ObjectInstance::Crob { code, .. } => {
                Some(PointValue::Binary(matches!(code, CROB_PULSE_ON | CROB_LATCH_ON)))
            }
            ObjectInstance::CounterU32 { value, .. } => Some(PointValue::Counter(value)),
            ObjectInstance::CounterU16 { value, .. } => Some(PointValue::Counter(value as u32)),
            ObjectInstance::AnalogI32 { value, .. } => Some(PointValue::Analog(value as f64)),
            ObjectInstance::AnalogI16 { value, .. } => Some(PointValue::Analog(value as f64)),
            ObjectInstance::AnalogF32 { value, .. } => Some(PointValue::Analog(value as f64)),
            ObjectInstance::AnalogF64 { value, .. } => Some(PointValue::Analog(value)),
            ObjectInstance::TimeMs(ms) => Some(PointValue::Time(ms)),
            ObjectInstance::TimeDelay(_) => None,
        }
    }

    /// Build a prototype instance for a variation, used when converting a
    /// point value into wire objects.
    pub fn from_point_value(variation: Variation, value: PointValue) -> Option<Self> {
        match (variation, value) {
            (Variation::BinaryInputPacked | Variation::BinaryOutputPacked, PointValue::Binary(b)) => {
                Some(ObjectInstance::Bit(b))
            }
            (
                Variation::BinaryInputFlags
                | Variation::BinaryInputEvent
                | Variation::BinaryOutputStatus,
                PointValue::Binary(b),
            ) => Some(ObjectInstance::binary(b)),
            (Variation::Counter32Flag | Variation::Counter32, PointValue::Counter(v)) => {
                Some(ObjectInstance::CounterU32 {
                    value: v,
                    flags: matches!(variation, Variation::Counter32Flag).then_some(FLAG_ONLINE),
                })
            }
            (Variation::Counter16Flag | Variation::Counter16, PointValue::Counter(v)) => {
                Some(ObjectInstance::CounterU16 {
                    value: v as u16,
                    flags: matches!(variation, Variation::Counter16Flag).then_some(FLAG_ONLINE),
                })
            }
            (Variation::AnalogInput32Flag | Variation::AnalogOutputStatus32, PointValue::Analog(v)) => {
                Some(ObjectInstance::AnalogI32 {
                    value: v as i32,
                    flags: Some(FLAG_ONLINE),
                })
            }
            (Variation::AnalogInputFloatFlag, PointValue::Analog(v)) => {
                Some(ObjectInstance::AnalogF32 {
                    value: v as f32,
                    flags: FLAG_ONLINE,
                })
            }
            (Variation::AnalogInputDoubleFlag, PointValue::Analog(v)) => {
                Some(ObjectInstance::AnalogF64 {
                    value: v,
                    flags: FLAG_ONLINE,
                })
            }
            (Variation::AnalogOutputBlock32, PointValue::Analog(v)) => {
                Some(ObjectInstance::AnalogI32 {
                    value: v as i32,
                    flags: Some(0),
                })
            }
            (Variation::TimeAndDate, PointValue::Time(ms)) => Some(ObjectInstance::TimeMs(ms)),
            _ => None,
        }
    }
}

fn put_time48(buf: &mut BytesMut, ms: u64) {
    buf.put_slice(&ms.to_le_bytes()[..6]);
}

fn get_time48(buf: &mut impl Buf) -> u64 {
    let mut bytes = [0u8; 8];
    buf.copy_to_slice(&mut bytes[..6]);
    u64::from_le_bytes(bytes)
}

/// Serialize one instance according to the variation's layout. Packed
/// variations are handled by the item writer, not here.
pub fn encode_instance(
    variation: Variation,
    instance: &ObjectInstance,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    use ObjectInstance::*;
    match (variation, instance) {
        (
            Variation::BinaryInputFlags
            | Variation::BinaryInputEvent
            | Variation::BinaryOutputStatus,
            Flags { flags },
        ) => buf.put_u8(*flags),
        (Variation::BinaryInputEventAbsTime, FlagsAbsTime { flags, time_ms }) => {
            buf.put_u8(*flags);
            put_time48(buf, *time_ms);
        }
        (Variation::BinaryInputEventRelTime, FlagsRelTime { flags, delta_ms }) => {
            buf.put_u8(*flags);
            buf.put_u16_le(*delta_ms);
        }
        (
            Variation::ControlRelayOutputBlock,
            Crob {
                code,
                count,
                on_time_ms,
                off_time_ms,
                status,
            },
        ) => {
            buf.put_u8(*code);
            buf.put_u8(*count);
            buf.put_u32_le(*on_time_ms);
            buf.put_u32_le(*off_time_ms);
            buf.put_u8(*status);
        }
        (Variation::Counter32Flag, CounterU32 { value, flags: Some(flags) }) => {
            buf.put_u8(*flags);
            buf.put_u32_le(*value);
        }
        (Variation::Counter16Flag, CounterU16 { value, flags: Some(flags) }) => {
            buf.put_u8(*flags);
            buf.put_u16_le(*value);
        }
        (Variation::Counter32, CounterU32 { value, .. }) => buf.put_u32_le(*value),
        (Variation::Counter16, CounterU16 { value, .. }) => buf.put_u16_le(*value),
        (
            Variation::AnalogInput32Flag
            | Variation::AnalogInputEvent32
            | Variation::AnalogOutputStatus32,
            AnalogI32 { value, flags: Some(flags) },
        ) => {
            buf.put_u8(*flags);
            buf.put_i32_le(*value);
        }
        (
            Variation::AnalogInput16Flag
            | Variation::AnalogInputEvent16
            | Variation::AnalogOutputStatus16,
            AnalogI16 { value, flags: Some(flags) },
        ) => {
            buf.put_u8(*flags);
            buf.put_i16_le(*value);
        }
        (Variation::AnalogInput32, AnalogI32 { value, .. }) => buf.put_i32_le(*value),
        (Variation::AnalogInput16, AnalogI16 { value, .. }) => buf.put_i16_le(*value),
        (
            Variation::AnalogInputFloatFlag
            | Variation::AnalogInputEventFloat
            | Variation::AnalogOutputStatusFloat,
            AnalogF32 { value, flags },
        ) => {
            buf.put_u8(*flags);
            buf.put_f32_le(*value);
        }
        (
            Variation::AnalogInputDoubleFlag | Variation::AnalogOutputStatusDouble,
            AnalogF64 { value, flags },
        ) => {
            buf.put_u8(*flags);
            buf.put_f64_le(*value);
        }
        // Output blocks carry the status octet after the value.
        (Variation::AnalogOutputBlock32, AnalogI32 { value, flags }) => {
            buf.put_i32_le(*value);
            buf.put_u8(flags.unwrap_or(0));
        }
        (Variation::AnalogOutputBlock16, AnalogI16 { value, flags }) => {
            buf.put_i16_le(*value);
            buf.put_u8(flags.unwrap_or(0));
        }
        (Variation::AnalogOutputBlockFloat, AnalogF32 { value, flags }) => {
            buf.put_f32_le(*value);
            buf.put_u8(*flags);
        }
        (Variation::AnalogOutputBlockDouble, AnalogF64 { value, flags }) => {
            buf.put_f64_le(*value);
            buf.put_u8(*flags);
        }
        (
            Variation::TimeAndDate | Variation::CtoSynchronized | Variation::CtoUnsynchronized,
            TimeMs(ms),
        ) => put_time48(buf, *ms),
        (Variation::TimeDelayCoarse | Variation::TimeDelayFine, TimeDelay(value)) => {
            buf.put_u16_le(*value)
        }
        _ => return Err(ProtocolError::ParameterError),
    }
    Ok(())
}

/// Decode one instance. The caller has already checked that `buf` holds at
/// least the fixed size for the variation.
pub fn decode_instance(
    variation: Variation,
    buf: &mut impl Buf,
) -> Result<ObjectInstance, ProtocolError> {
    let size = match variation.descriptor().size {
        Size::Fixed(size) => size,
        // Packed bits and header-only variations never reach here.
        Size::Packed | Size::None => return Err(ProtocolError::ParameterError),
    };
    if buf.remaining() < size {
        return Err(ProtocolError::UnexpectedFragment);
    }
    let instance = match variation {
        Variation::BinaryInputFlags
        | Variation::BinaryInputEvent
        | Variation::BinaryOutputStatus => ObjectInstance::Flags { flags: buf.get_u8() },
        Variation::BinaryInputEventAbsTime => ObjectInstance::FlagsAbsTime {
            flags: buf.get_u8(),
            time_ms: get_time48(buf),
        },
        Variation::BinaryInputEventRelTime => ObjectInstance::FlagsRelTime {
            flags: buf.get_u8(),
            delta_ms: buf.get_u16_le(),
        },
        Variation::ControlRelayOutputBlock => ObjectInstance::Crob {
            code: buf.get_u8(),
            count: buf.get_u8(),
            on_time_ms: buf.get_u32_le(),
            off_time_ms: buf.get_u32_le(),
            status: buf.get_u8(),
        },
        Variation::Counter32Flag => ObjectInstance::CounterU32 {
            flags: Some(buf.get_u8()),
            value: buf.get_u32_le(),
        },
        Variation::Counter16Flag => ObjectInstance::CounterU16 {
            flags: Some(buf.get_u8()),
            value: buf.get_u16_le(),
        },
        Variation::Counter32 => ObjectInstance::CounterU32 {
            value: buf.get_u32_le(),
            flags: None,
        },
        Variation::Counter16 => ObjectInstance::CounterU16 {
            value: buf.get_u16_le(),
            flags: None,
        },
        Variation::AnalogInput32Flag
        | Variation::AnalogInputEvent32
        | Variation::AnalogOutputStatus32 => ObjectInstance::AnalogI32 {
            flags: Some(buf.get_u8()),
            value: buf.get_i32_le(),
        },
        Variation::AnalogInput16Flag
        | Variation::AnalogInputEvent16
        | Variation::AnalogOutputStatus16 => ObjectInstance::AnalogI16 {
            flags: Some(buf.get_u8()),
            value: buf.get_i16_le(),
        },
        Variation::AnalogInput32 => ObjectInstance::AnalogI32 {
            value: buf.get_i32_le(),
            flags: None,
        },
        Variation::AnalogInput16 => ObjectInstance::AnalogI16 {
            value: buf.get_i16_le(),
            flags: None,
        },
        Variation::AnalogInputFloatFlag
        | Variation::AnalogInputEventFloat
        | Variation::AnalogOutputStatusFloat => ObjectInstance::AnalogF32 {
            flags: buf.get_u8(),
            value: buf.get_f32_le(),
        },
        Variation::AnalogInputDoubleFlag | Variation::AnalogOutputStatusDouble => {
            ObjectInstance::AnalogF64 {
                flags: buf.get_u8(),
                value: buf.get_f64_le(),
            }
        }
        Variation::AnalogOutputBlock32 => {
            let value = buf.get_i32_le();
            ObjectInstance::AnalogI32 {
                value,
                flags: Some(buf.get_u8()),
            }
        }
        Variation::AnalogOutputBlock16 => {
            let value = buf.get_i16_le();
            ObjectInstance::AnalogI16 {
                value,
                flags: Some(buf.get_u8()),
            }
        }
        Variation::AnalogOutputBlockFloat => {
            let value = buf.get_f32_le();
            ObjectInstance::AnalogF32 {
                value,
                flags: buf.get_u8(),
            }
        }
        Variation::AnalogOutputBlockDouble => {
            let value = buf.get_f64_le();
            ObjectInstance::AnalogF64 {
                value,
                flags: buf.get_u8(),
            }
        }
        Variation::TimeAndDate | Variation::CtoSynchronized | Variation::CtoUnsynchronized => {
            ObjectInstance::TimeMs(get_time48(buf))
        }
        Variation::TimeDelayCoarse | Variation::TimeDelayFine => {
            ObjectInstance::TimeDelay(buf.get_u16_le())
        }
        Variation::BinaryInputPacked
        | Variation::BinaryOutputPacked
        | Variation::InternalIndicationsPacked
        | Variation::Class0Data
        | Variation::Class1Data
        | Variation::Class2Data
        | Variation::Class3Data => return Err(ProtocolError::ParameterError),
    };
    Ok(instance)
}

/// One prototype instance per variation, for registry round-trip tests.
pub fn prototype(variation: Variation) -> Option<ObjectInstance> {
    use ObjectInstance::*;
    let instance = match variation {
        Variation::BinaryInputPacked
        | Variation::BinaryOutputPacked
        | Variation::InternalIndicationsPacked => Bit(true),
        Variation::BinaryInputFlags
        | Variation::BinaryInputEvent
        | Variation::BinaryOutputStatus => Flags {
            flags: FLAG_ONLINE | FLAG_STATE,
        },
        Variation::BinaryInputEventAbsTime => FlagsAbsTime {
            flags: FLAG_ONLINE,
            time_ms: 0x0000_0123_4567_89AB,
        },
        Variation::BinaryInputEventRelTime => FlagsRelTime {
            flags: FLAG_ONLINE,
            delta_ms: 1234,
        },
        Variation::ControlRelayOutputBlock => Crob {
            code: CROB_LATCH_ON,
            count: 1,
            on_time_ms: 100,
            off_time_ms: 200,
            status: 0,
        },
        Variation::Counter32Flag => CounterU32 {
            value: 0xDEAD_BEEF,
            flags: Some(FLAG_ONLINE),
        },
        Variation::Counter16Flag => CounterU16 {
            value: 4000,
            flags: Some(FLAG_ONLINE),
        },
        Variation::Counter32 => CounterU32 {
            value: 77,
            flags: None,
        },
        Variation::Counter16 => CounterU16 {
            value: 42,
            flags: None,
        },
        Variation::AnalogInput32Flag
        | Variation::AnalogInputEvent32
        | Variation::AnalogOutputStatus32 => AnalogI32 {
            value: -123_456,
            flags: Some(FLAG_ONLINE),
        },
        Variation::AnalogInput16Flag
        | Variation::AnalogInputEvent16
        | Variation::AnalogOutputStatus16 => AnalogI16 {
            value: -1234,
            flags: Some(FLAG_ONLINE),
        },
        Variation::AnalogInput32 => AnalogI32 {
            value: 99_999,
            flags: None,
        },
        Variation::AnalogInput16 => AnalogI16 {
            value: 512,
            flags: None,
        },
        Variation::AnalogInputFloatFlag
        | Variation::AnalogInputEventFloat
        | Variation::AnalogOutputStatusFloat => AnalogF32 {
            value: 3.5,
            flags: FLAG_ONLINE,
        },
        Variation::AnalogInputDoubleFlag | Variation::AnalogOutputStatusDouble => AnalogF64 {
            value: -2.25,
            flags: FLAG_ONLINE,
        },
        Variation::AnalogOutputBlock32 => AnalogI32 {
            value: 2048,
            flags: Some(0),
        },
        Variation::AnalogOutputBlock16 => AnalogI16 {
            value: 128,
            flags: Some(0),
        },
        Variation::AnalogOutputBlockFloat => AnalogF32 {
            value: 1.5,
            flags: 0,
        },
        Variation::AnalogOutputBlockDouble => AnalogF64 {
            value: 0.5,
            flags: 0,
        },
        Variation::TimeAndDate | Variation::CtoSynchronized | Variation::CtoUnsynchronized => {
            TimeMs(0x0000_00AB_CDEF_0123)
        }
        Variation::TimeDelayCoarse | Variation::TimeDelayFine => TimeDelay(300),
        Variation::Class0Data
        | Variation::Class1Data
        | Variation::Class2Data
        | Variation::Class3Data => return None,
    };
    Some(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::variation::Size;

    #[test]
    fn every_fixed_variation_round_trips() {
        for variation in Variation::all() {
            let Size::Fixed(size) = variation.descriptor().size else {
                continue;
            };
            let instance = prototype(variation).unwrap();
            let mut buf = BytesMut::new();
            encode_instance(variation, &instance, &mut buf).unwrap();
            assert_eq!(buf.len(), size, "{variation:?} encoded size");
            let mut cursor = buf.freeze();
            let decoded = decode_instance(variation, &mut cursor).unwrap();
            assert_eq!(decoded, instance, "{variation:?} round trip");
            assert!(!cursor.has_remaining());
        }
    }

    #[test]
    fn mismatched_instance_rejected() {
        let mut buf = BytesMut::new();
        let result = encode_instance(
            Variation::ControlRelayOutputBlock,
            &ObjectInstance::TimeDelay(1),
            &mut buf,
        );
        assert!(matches!(result, Err(ProtocolError::ParameterError)));
    }

    #[test]
    fn truncated_input_rejected() {
        let mut short = bytes::Bytes::from_static(&[0x01, 0x02]);
        assert!(matches!(
            decode_instance(Variation::Counter32Flag, &mut short),
            Err(ProtocolError::UnexpectedFragment)
        ));
    }

    #[test]
    fn binary_state_maps_to_point_value() {
        let instance = ObjectInstance::binary(true);
        assert_eq!(instance.as_point_value(), Some(PointValue::Binary(true)));
        let instance = ObjectInstance::binary(false);
        assert_eq!(instance.as_point_value(), Some(PointValue::Binary(false)));
    }

    #[test]
    fn time48_round_trips_at_bounds() {
        let max48 = (1u64 << 48) - 1;
        let mut buf = BytesMut::new();
        encode_instance(Variation::TimeAndDate, &ObjectInstance::TimeMs(max48), &mut buf).unwrap();
        let mut cursor = buf.freeze();
        assert_eq!(
            decode_instance(Variation::TimeAndDate, &mut cursor).unwrap(),
            ObjectInstance::TimeMs(max48)
        );
    }
}
