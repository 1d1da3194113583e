use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::app::header::{AppControl, FunctionCode, Iin};
use crate::error::ProtocolError;
use crate::objects::{parse_item, write_item, Item, PointValue};

/// One application-layer protocol data unit: a 2-byte request header or a
/// 4-byte response header (with internal indications), then the items.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub control: AppControl,
    pub function: FunctionCode,
    pub iin: Option<Iin>,
    pub items: Vec<Item>,
}

impl Fragment {
    pub fn request(function: FunctionCode, control: AppControl, items: Vec<Item>) -> Self {
        Fragment {
            control,
            function,
            iin: None,
            items,
        }
    }

    pub fn response(
        function: FunctionCode,
        control: AppControl,
        iin: Iin,
        items: Vec<Item>,
    ) -> Self {
        Fragment {
            control,
            function,
            iin: Some(iin),
            items,
        }
    }

    pub fn confirm(seq: u8, uns: bool) -> Self {
        Fragment {
            control: AppControl {
                fir: true,
                fin: true,
                con: false,
                uns,
                seq,
            },
            function: FunctionCode::Confirm,
            iin: None,
            items: Vec::new(),
        }
    }

    pub fn header_len(function: FunctionCode) -> usize {
        if function.is_response() {
            4
        } else {
            2
        }
    }

    pub fn parse(mut bytes: Bytes) -> Result<Fragment, ProtocolError> {
        if bytes.remaining() < 2 {
            return Err(ProtocolError::ApplicationHeaderIncomplete);
        }
        let control = AppControl::from_byte(bytes.get_u8());
        let function = FunctionCode::from_code(bytes.get_u8())?;
        let iin = if function.is_response() {
            if bytes.remaining() < 2 {
                return Err(ProtocolError::ApplicationHeaderIncomplete);
            }
            Some(Iin(bytes.get_u16_le()))
        } else {
            None
        };
        let needs_values = function.needs_values();
        let mut items = Vec::new();
        while bytes.has_remaining() {
            items.push(parse_item(&mut bytes, needs_values)?);
        }
        Ok(Fragment {
            control,
            function,
            iin,
            items,
        })
    }

    pub fn serialize(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.control.to_byte());
        buf.put_u8(self.function.code());
        if self.function.is_response() {
            buf.put_u16_le(self.iin.unwrap_or_default().bits());
        }
        let needs_values = self.function.needs_values();
        for item in &self.items {
            write_item(item, buf, needs_values)?;
        }
        Ok(())
    }

    /// Flatten the items into `(point index, value)` pairs, in item order.
    pub fn point_values(&self) -> Vec<(Option<u32>, PointValue)> {
        let mut values = Vec::new();
        for item in &self.items {
            for (position, instance) in item.instances.iter().enumerate() {
                if let Some(value) = instance.as_point_value() {
                    values.push((item.index_of(position), value));
                }
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ObjectInstance, Variation};

    #[test]
    fn read_request_wire_form() {
        // S2: READ of binary input index 7 -> C0 01 01 02 01 07 00 07 00
        let fragment = Fragment::request(
            FunctionCode::Read,
            AppControl::single(0),
            vec![Item::read_range(Variation::BinaryInputFlags, 7, 7)],
        );
        let bytes = fragment.serialize().unwrap();
        assert_eq!(
            &bytes[..],
            &[0xC0, 0x01, 0x01, 0x02, 0x01, 0x07, 0x00, 0x07, 0x00]
        );
        let parsed = Fragment::parse(bytes).unwrap();
        assert_eq!(parsed, fragment);
    }

    #[test]
    fn response_carries_iin() {
        let fragment = Fragment::response(
            FunctionCode::Response,
            AppControl::single(5),
            Iin::new().with(Iin::DEVICE_RESTART),
            vec![Item::range_values(
                Variation::BinaryInputFlags,
                7,
                vec![ObjectInstance::binary(true)],
            )],
        );
        let bytes = fragment.serialize().unwrap();
        assert_eq!(bytes.len(), 4 + 3 + 2 + 1);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), Iin::DEVICE_RESTART);
        let parsed = Fragment::parse(bytes).unwrap();
        assert_eq!(parsed, fragment);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            Fragment::parse(Bytes::from_static(&[0xC0])),
            Err(ProtocolError::ApplicationHeaderIncomplete)
        ));
        // Response function without room for the IIN field.
        assert!(matches!(
            Fragment::parse(Bytes::from_static(&[0xC0, 129, 0x00])),
            Err(ProtocolError::ApplicationHeaderIncomplete)
        ));
    }

    #[test]
    fn confirm_fragment_is_header_only() {
        let fragment = Fragment::confirm(11, true);
        let bytes = fragment.serialize().unwrap();
        assert_eq!(bytes.len(), 2);
        let parsed = Fragment::parse(bytes).unwrap();
        assert_eq!(parsed.function, FunctionCode::Confirm);
        assert!(parsed.control.uns);
        assert_eq!(parsed.control.seq, 11);
    }

    #[test]
    fn point_values_carry_indices() {
        let fragment = Fragment::response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(),
            vec![
                Item::range_values(
                    Variation::AnalogInput16,
                    4,
                    vec![
                        ObjectInstance::AnalogI16 { value: 10, flags: None },
                        ObjectInstance::AnalogI16 { value: 20, flags: None },
                    ],
                ),
                Item::indexed_values(
                    Variation::BinaryInputFlags,
                    vec![(9, ObjectInstance::binary(true))],
                ),
            ],
        );
        let values = fragment.point_values();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], (Some(4), PointValue::Analog(10.0)));
        assert_eq!(values[1], (Some(5), PointValue::Analog(20.0)));
        assert_eq!(values[2], (Some(9), PointValue::Binary(true)));
    }
}
