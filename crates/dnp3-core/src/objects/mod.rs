pub mod instance;
pub mod variation;

pub use instance::{
    decode_instance, encode_instance, prototype, ObjectInstance, PointValue, FLAG_ONLINE,
    FLAG_STATE,
};
pub use variation::{PointType, Size, Variation, VariationDescriptor};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Width of a range or prefix field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeWidth {
    U8,
    U16,
    U32,
}

impl RangeWidth {
    pub fn narrowest(value: u32) -> Self {
        if value <= u8::MAX as u32 {
            RangeWidth::U8
        } else if value <= u16::MAX as u32 {
            RangeWidth::U16
        } else {
            RangeWidth::U32
        }
    }

    pub fn size(self) -> usize {
        match self {
            RangeWidth::U8 => 1,
            RangeWidth::U16 => 2,
            RangeWidth::U32 => 4,
        }
    }

    fn put(self, buf: &mut BytesMut, value: u32) {
        match self {
            RangeWidth::U8 => buf.put_u8(value as u8),
            RangeWidth::U16 => buf.put_u16_le(value as u16),
            RangeWidth::U32 => buf.put_u32_le(value),
        }
    }

    fn get(self, buf: &mut impl Buf) -> Result<u32, ProtocolError> {
        if buf.remaining() < self.size() {
            return Err(ProtocolError::UnexpectedFragment);
        }
        let value = match self {
            RangeWidth::U8 => buf.get_u8() as u32,
            RangeWidth::U16 => buf.get_u16_le() as u32,
            RangeWidth::U32 => buf.get_u32_le(),
        };
        Ok(value)
    }
}

/// Qualifier bits 4..6: what precedes each encoded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixCode {
    None,
    IndexByte,
    IndexShort,
    IndexInt,
    SizeByte,
    SizeShort,
    SizeInt,
}

impl PrefixCode {
    pub fn bits(self) -> u8 {
        match self {
            PrefixCode::None => 0,
            PrefixCode::IndexByte => 1,
            PrefixCode::IndexShort => 2,
            PrefixCode::IndexInt => 3,
            PrefixCode::SizeByte => 4,
            PrefixCode::SizeShort => 5,
            PrefixCode::SizeInt => 6,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        let code = match bits {
            0 => PrefixCode::None,
            1 => PrefixCode::IndexByte,
            2 => PrefixCode::IndexShort,
            3 => PrefixCode::IndexInt,
            4 => PrefixCode::SizeByte,
            5 => PrefixCode::SizeShort,
            6 => PrefixCode::SizeInt,
            _ => return Err(ProtocolError::ParameterError),
        };
        Ok(code)
    }

    pub fn index_width(max_index: u32) -> Self {
        match RangeWidth::narrowest(max_index) {
            RangeWidth::U8 => PrefixCode::IndexByte,
            RangeWidth::U16 => PrefixCode::IndexShort,
            RangeWidth::U32 => PrefixCode::IndexInt,
        }
    }

    pub fn width(self) -> Option<RangeWidth> {
        match self {
            PrefixCode::None => None,
            PrefixCode::IndexByte | PrefixCode::SizeByte => Some(RangeWidth::U8),
            PrefixCode::IndexShort | PrefixCode::SizeShort => Some(RangeWidth::U16),
            PrefixCode::IndexInt | PrefixCode::SizeInt => Some(RangeWidth::U32),
        }
    }

    pub fn is_index(self) -> bool {
        matches!(
            self,
            PrefixCode::IndexByte | PrefixCode::IndexShort | PrefixCode::IndexInt
        )
    }

    pub fn is_size(self) -> bool {
        matches!(
            self,
            PrefixCode::SizeByte | PrefixCode::SizeShort | PrefixCode::SizeInt
        )
    }
}

/// Qualifier bits 0..3: shape of the range specifier that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpecifier {
    StartStopIndex { start: u32, stop: u32, width: RangeWidth },
    StartStopAddress { start: u32, stop: u32, width: RangeWidth },
    AllObjects,
    Count { count: u32, width: RangeWidth },
    FreeFormat { count: u8 },
}

impl RangeSpecifier {
    pub fn start_stop(start: u32, stop: u32) -> Self {
        RangeSpecifier::StartStopIndex {
            start,
            stop,
            width: RangeWidth::narrowest(stop),
        }
    }

    pub fn count(count: u32) -> Self {
        RangeSpecifier::Count {
            count,
            width: RangeWidth::narrowest(count),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RangeSpecifier::StartStopIndex { width, .. } => match width {
                RangeWidth::U8 => 0x00,
                RangeWidth::U16 => 0x01,
                RangeWidth::U32 => 0x02,
            },
            RangeSpecifier::StartStopAddress { width, .. } => match width {
                RangeWidth::U8 => 0x03,
                RangeWidth::U16 => 0x04,
                RangeWidth::U32 => 0x05,
            },
            RangeSpecifier::AllObjects => 0x06,
            RangeSpecifier::Count { width, .. } => match width {
                RangeWidth::U8 => 0x07,
                RangeWidth::U16 => 0x08,
                RangeWidth::U32 => 0x09,
            },
            RangeSpecifier::FreeFormat { .. } => 0x0B,
        }
    }

    /// Number of encoded objects the range announces, when it announces one.
    pub fn object_count(self) -> Option<usize> {
        match self {
            RangeSpecifier::StartStopIndex { start, stop, .. }
            | RangeSpecifier::StartStopAddress { start, stop, .. } => {
                Some((stop - start + 1) as usize)
            }
            RangeSpecifier::AllObjects => None,
            RangeSpecifier::Count { count, .. } => Some(count as usize),
            RangeSpecifier::FreeFormat { count } => Some(count as usize),
        }
    }

    pub fn start_index(self) -> Option<u32> {
        match self {
            RangeSpecifier::StartStopIndex { start, .. }
            | RangeSpecifier::StartStopAddress { start, .. } => Some(start),
            _ => None,
        }
    }

    fn encoded_size(self) -> usize {
        match self {
            RangeSpecifier::StartStopIndex { width, .. }
            | RangeSpecifier::StartStopAddress { width, .. } => 2 * width.size(),
            RangeSpecifier::AllObjects => 0,
            RangeSpecifier::Count { width, .. } => width.size(),
            RangeSpecifier::FreeFormat { .. } => 1,
        }
    }

    fn write(self, buf: &mut BytesMut) {
        match self {
            RangeSpecifier::StartStopIndex { start, stop, width }
            | RangeSpecifier::StartStopAddress { start, stop, width } => {
                width.put(buf, start);
                width.put(buf, stop);
            }
            RangeSpecifier::AllObjects => {}
            RangeSpecifier::Count { count, width } => width.put(buf, count),
            RangeSpecifier::FreeFormat { count } => buf.put_u8(count),
        }
    }

    fn read(code: u8, buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let width_for = |code_base: u8| match code - code_base {
            0 => RangeWidth::U8,
            1 => RangeWidth::U16,
            _ => RangeWidth::U32,
        };
        let range = match code {
            0x00..=0x02 => {
                let width = width_for(0x00);
                let start = width.get(buf)?;
                let stop = width.get(buf)?;
                if stop < start {
                    return Err(ProtocolError::ParameterError);
                }
                RangeSpecifier::StartStopIndex { start, stop, width }
            }
            0x03..=0x05 => {
                let width = width_for(0x03);
                let start = width.get(buf)?;
                let stop = width.get(buf)?;
                if stop < start {
                    return Err(ProtocolError::ParameterError);
                }
                RangeSpecifier::StartStopAddress { start, stop, width }
            }
            0x06 => RangeSpecifier::AllObjects,
            0x07..=0x09 => {
                let width = width_for(0x07);
                RangeSpecifier::Count {
                    count: width.get(buf)?,
                    width,
                }
            }
            0x0B => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::UnexpectedFragment);
                }
                RangeSpecifier::FreeFormat {
                    count: buf.get_u8(),
                }
            }
            _ => return Err(ProtocolError::ParameterError),
        };
        Ok(range)
    }
}

/// One application item: object header plus optional per-object indices,
/// sizes, and instances.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub variation: Variation,
    pub prefix: PrefixCode,
    pub range: RangeSpecifier,
    pub indices: Vec<u32>,
    pub sizes: Vec<u32>,
    pub instances: Vec<ObjectInstance>,
}

impl Item {
    /// Header-only item for a read over an index range. Masters conventionally
    /// issue 16-bit start/stop ranges (qualifier 0x01).
    pub fn read_range(variation: Variation, start: u32, stop: u32) -> Self {
        let width = if stop > u16::MAX as u32 {
            RangeWidth::U32
        } else {
            RangeWidth::U16
        };
        Item {
            variation,
            prefix: PrefixCode::None,
            range: RangeSpecifier::StartStopIndex { start, stop, width },
            indices: Vec::new(),
            sizes: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Header-only item addressing all objects of the variation.
    pub fn all(variation: Variation) -> Self {
        Item {
            variation,
            prefix: PrefixCode::None,
            range: RangeSpecifier::AllObjects,
            indices: Vec::new(),
            sizes: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Contiguous instances starting at `start`.
    pub fn range_values(variation: Variation, start: u32, instances: Vec<ObjectInstance>) -> Self {
        let stop = start + instances.len().saturating_sub(1) as u32;
        Item {
            variation,
            prefix: PrefixCode::None,
            range: RangeSpecifier::start_stop(start, stop),
            indices: Vec::new(),
            sizes: Vec::new(),
            instances,
        }
    }

    /// Count-ranged contiguous instances with no prefix, e.g. a time write.
    pub fn counted_values(variation: Variation, instances: Vec<ObjectInstance>) -> Self {
        Item {
            variation,
            prefix: PrefixCode::None,
            range: RangeSpecifier::count(instances.len() as u32),
            indices: Vec::new(),
            sizes: Vec::new(),
            instances,
        }
    }

    /// Index-prefixed instances, count-ranged, narrowest index width.
    pub fn indexed_values(variation: Variation, pairs: Vec<(u32, ObjectInstance)>) -> Self {
        let max_index = pairs.iter().map(|(i, _)| *i).max().unwrap_or(0);
        let (indices, instances): (Vec<u32>, Vec<ObjectInstance>) = pairs.into_iter().unzip();
        Item {
            variation,
            prefix: PrefixCode::index_width(max_index),
            range: RangeSpecifier::count(instances.len() as u32),
            indices,
            sizes: Vec::new(),
            instances,
        }
    }

    pub fn qualifier(&self) -> u8 {
        (self.prefix.bits() << 4) | self.range.code()
    }

    /// Point index of the instance at `position`, from the per-object index
    /// when prefixed, else from the range start.
    pub fn index_of(&self, position: usize) -> Option<u32> {
        if self.prefix.is_index() {
            self.indices.get(position).copied()
        } else {
            self.range.start_index().map(|start| start + position as u32)
        }
    }

    /// Serialized byte length, including the 3-byte object header.
    pub fn encoded_len(&self, needs_values: bool) -> Result<usize, ProtocolError> {
        let mut len = 3 + self.range.encoded_size();
        if !needs_values {
            // A prefixed read still carries its index list.
            if self.prefix.is_index() {
                len += self.prefix.width().map_or(0, RangeWidth::size) * self.indices.len();
            }
            return Ok(len);
        }
        match self.variation.descriptor().size {
            Size::None => {}
            Size::Packed => {
                let count = self.range.object_count().ok_or(ProtocolError::ParameterError)?;
                len += count.div_ceil(8);
            }
            Size::Fixed(size) => {
                let per_object = size + self.prefix.width().map_or(0, RangeWidth::size);
                len += per_object * self.instances.len();
            }
        }
        Ok(len)
    }
}

/// Serialize one item. `needs_values` follows the fragment's function code:
/// reads emit headers and ranges only.
pub fn write_item(
    item: &Item,
    buf: &mut BytesMut,
    needs_values: bool,
) -> Result<(), ProtocolError> {
    let (group, var) = item.variation.group_var();
    buf.put_u8(group);
    buf.put_u8(var);
    buf.put_u8(item.qualifier());
    item.range.write(buf);

    if !needs_values {
        if let Some(width) = item.prefix.width() {
            if item.prefix.is_index() {
                for index in &item.indices {
                    width.put(buf, *index);
                }
            }
        }
        return Ok(());
    }

    let descriptor = item.variation.descriptor();
    match descriptor.size {
        Size::None => Ok(()),
        Size::Packed => {
            let count = item
                .range
                .object_count()
                .ok_or(ProtocolError::ParameterError)?;
            if item.prefix != PrefixCode::None || item.instances.len() != count {
                return Err(ProtocolError::ParameterError);
            }
            let mut packed = vec![0u8; count.div_ceil(8)];
            for (bit, instance) in item.instances.iter().enumerate() {
                let ObjectInstance::Bit(state) = instance else {
                    return Err(ProtocolError::ParameterError);
                };
                if *state {
                    packed[bit / 8] |= 1 << (bit % 8);
                }
            }
            buf.put_slice(&packed);
            Ok(())
        }
        Size::Fixed(size) => {
            if item.prefix.is_index() && item.indices.len() != item.instances.len() {
                return Err(ProtocolError::ParameterError);
            }
            if let Some(count) = item.range.object_count() {
                if item.instances.len() != count {
                    return Err(ProtocolError::ParameterError);
                }
            }
            for (position, instance) in item.instances.iter().enumerate() {
                if let Some(width) = item.prefix.width() {
                    let value = if item.prefix.is_index() {
                        item.indices[position]
                    } else {
                        size as u32
                    };
                    width.put(buf, value);
                }
                encode_instance(item.variation, instance, buf)?;
            }
            Ok(())
        }
    }
}

/// Decode one item from the fragment body.
pub fn parse_item(buf: &mut Bytes, needs_values: bool) -> Result<Item, ProtocolError> {
    if buf.remaining() < 3 {
        return Err(ProtocolError::UnexpectedFragment);
    }
    let group = buf.get_u8();
    let var = buf.get_u8();
    let qualifier = buf.get_u8();
    let prefix = PrefixCode::from_bits((qualifier >> 4) & 0x07)?;
    let range = RangeSpecifier::read(qualifier & 0x0F, buf)?;

    let variation =
        Variation::from_group_var(group, var).ok_or(ProtocolError::ObjectUnknown)?;

    // Index and size prefixes only pair with counted ranges.
    if prefix != PrefixCode::None
        && !matches!(
            range,
            RangeSpecifier::Count { .. } | RangeSpecifier::FreeFormat { .. }
        )
    {
        return Err(ProtocolError::ParameterError);
    }

    let mut item = Item {
        variation,
        prefix,
        range,
        indices: Vec::new(),
        sizes: Vec::new(),
        instances: Vec::new(),
    };

    if !needs_values {
        // Index-prefixed reads list the requested indices without payloads.
        if let (true, Some(width)) = (prefix.is_index(), prefix.width()) {
            let count = range.object_count().ok_or(ProtocolError::ParameterError)?;
            if buf.remaining() < count * width.size() {
                return Err(ProtocolError::UnexpectedFragment);
            }
            item.indices.reserve(count);
            for _ in 0..count {
                item.indices.push(width.get(buf)?);
            }
        }
        return Ok(item);
    }

    let descriptor = variation.descriptor();
    match descriptor.size {
        Size::None => {}
        Size::Packed => {
            if prefix != PrefixCode::None {
                return Err(ProtocolError::ParameterError);
            }
            let count = range.object_count().ok_or(ProtocolError::ParameterError)?;
            let byte_count = count.div_ceil(8);
            if buf.remaining() < byte_count {
                return Err(ProtocolError::UnexpectedFragment);
            }
            let packed = buf.copy_to_bytes(byte_count);
            item.instances.reserve(count);
            for bit in 0..count {
                let state = packed[bit / 8] & (1 << (bit % 8)) != 0;
                item.instances.push(ObjectInstance::Bit(state));
            }
        }
        Size::Fixed(size) => {
            let count = range.object_count().ok_or(ProtocolError::ParameterError)?;
            let per_object = size + prefix.width().map_or(0, RangeWidth::size);
            // Bound check up front so a forged count cannot trigger a huge
            // allocation.
            if buf.remaining() < count * per_object {
                return Err(ProtocolError::UnexpectedFragment);
            }
            item.instances.reserve(count);
            for _ in 0..count {
                if let Some(width) = prefix.width() {
                    let value = width.get(buf)?;
                    if prefix.is_index() {
                        item.indices.push(value);
                    } else {
                        item.sizes.push(value);
                    }
                }
                item.instances.push(decode_instance(variation, buf)?);
            }
        }
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(item: &Item, needs_values: bool) -> Item {
        let mut buf = BytesMut::new();
        write_item(item, &mut buf, needs_values).unwrap();
        assert_eq!(
            buf.len(),
            item.encoded_len(needs_values).unwrap(),
            "encoded_len mismatch"
        );
        let mut bytes = buf.freeze();
        let decoded = parse_item(&mut bytes, needs_values).unwrap();
        assert!(!bytes.has_remaining(), "trailing bytes");
        decoded
    }

    #[test]
    fn read_header_round_trip() {
        // S2: binary input at index 7 -> 16-bit start/stop qualifier.
        let item = Item::read_range(Variation::BinaryInputFlags, 7, 7);
        assert_eq!(item.qualifier(), 0x01);
        let decoded = round_trip(&item, false);
        assert_eq!(decoded, item);
    }

    #[test]
    fn huge_range_uses_u32_qualifier() {
        let item = Item::read_range(Variation::AnalogInput32Flag, 0, 100_000);
        assert_eq!(item.qualifier(), 0x02);
        assert_eq!(round_trip(&item, false), item);
    }

    #[test]
    fn indexed_read_carries_index_list_without_payloads() {
        let item = Item {
            variation: Variation::AnalogInput32Flag,
            prefix: PrefixCode::IndexByte,
            range: RangeSpecifier::count(3),
            indices: vec![2, 9, 40],
            sizes: Vec::new(),
            instances: Vec::new(),
        };
        assert_eq!(item.qualifier(), 0x17);
        let decoded = round_trip(&item, false);
        assert_eq!(decoded.indices, vec![2, 9, 40]);
        assert!(decoded.instances.is_empty());
    }

    #[test]
    fn all_objects_round_trip() {
        let item = Item::all(Variation::Class1Data);
        assert_eq!(item.qualifier(), 0x06);
        assert_eq!(round_trip(&item, false), item);
    }

    #[test]
    fn range_values_round_trip() {
        let item = Item::range_values(
            Variation::AnalogInput16,
            3,
            vec![
                ObjectInstance::AnalogI16 { value: -5, flags: None },
                ObjectInstance::AnalogI16 { value: 1000, flags: None },
            ],
        );
        assert_eq!(round_trip(&item, true), item);
    }

    #[test]
    fn indexed_crob_round_trip() {
        // S4: direct operate of a CROB at index 3.
        let item = Item::indexed_values(
            Variation::ControlRelayOutputBlock,
            vec![(3, ObjectInstance::crob(instance::CROB_LATCH_ON, 100, 0))],
        );
        assert_eq!(item.prefix, PrefixCode::IndexByte);
        assert_eq!(item.qualifier(), 0x17);
        let decoded = round_trip(&item, true);
        assert_eq!(decoded.indices, vec![3]);
        assert_eq!(decoded, item);
    }

    #[test]
    fn packed_binary_round_trip() {
        let bits = vec![true, false, true, true, false, false, true, false, true, true];
        let item = Item {
            variation: Variation::BinaryInputPacked,
            prefix: PrefixCode::None,
            range: RangeSpecifier::start_stop(0, bits.len() as u32 - 1),
            indices: Vec::new(),
            sizes: Vec::new(),
            instances: bits.iter().map(|b| ObjectInstance::Bit(*b)).collect(),
        };
        let decoded = round_trip(&item, true);
        assert_eq!(decoded, item);
    }

    #[test]
    fn every_registered_variation_round_trips_in_an_item() {
        for variation in Variation::all() {
            let Some(proto) = prototype(variation) else {
                // Header-only variation.
                let item = Item::all(variation);
                assert_eq!(round_trip(&item, true), item);
                continue;
            };
            let item = if variation.descriptor().is_packed {
                Item {
                    variation,
                    prefix: PrefixCode::None,
                    range: RangeSpecifier::start_stop(0, 0),
                    indices: Vec::new(),
                    sizes: Vec::new(),
                    instances: vec![ObjectInstance::Bit(true)],
                }
            } else {
                Item::range_values(variation, 0, vec![proto])
            };
            let decoded = round_trip(&item, true);
            assert_eq!(decoded, item, "{variation:?}");
        }
    }

    #[test]
    fn unknown_group_yields_object_unknown() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x77, 0x01, 0x06]);
        let mut bytes = buf.freeze();
        assert!(matches!(
            parse_item(&mut bytes, false),
            Err(ProtocolError::ObjectUnknown)
        ));
    }

    #[test]
    fn reserved_range_code_yields_parameter_error() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x01, 0x02, 0x0A]);
        let mut bytes = buf.freeze();
        assert!(matches!(
            parse_item(&mut bytes, false),
            Err(ProtocolError::ParameterError)
        ));
    }

    #[test]
    fn inverted_start_stop_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x01, 0x02, 0x00, 9, 3]);
        let mut bytes = buf.freeze();
        assert!(matches!(
            parse_item(&mut bytes, false),
            Err(ProtocolError::ParameterError)
        ));
    }

    #[test]
    fn forged_count_does_not_overread() {
        let mut buf = BytesMut::new();
        // Count of 200 CROBs with two bytes of payload behind it.
        buf.put_slice(&[12, 1, 0x17, 200, 0xAA, 0xBB]);
        let mut bytes = buf.freeze();
        assert!(matches!(
            parse_item(&mut bytes, true),
            Err(ProtocolError::UnexpectedFragment)
        ));
    }
}
