use std::io::{Error, ErrorKind};

/// Which pieces a peer (or we) hold. Bit 0 is the high bit of the first byte,
/// as on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    payload: Vec<u8>,
    len: usize,
}

impl BitField {
    /// `len` pieces, none set
    pub fn new(len: usize) -> BitField {
        BitField {
            payload: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn full(len: usize) -> BitField {
        let mut bitfield = BitField::new(len);
        for index in 0..len {
            bitfield.set(index);
        }
        bitfield
    }

    /// Parses the payload of a bitfield message for a torrent of `len` pieces.
    /// Spare bits at the end are ignored.
    pub fn from_payload(bytes: &[u8], len: usize) -> Result<BitField, Error> {
        if bytes.len() != len.div_ceil(8) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "bitfield of {} bytes does not fit {} pieces",
                    bytes.len(),
                    len
                ),
            ));
        }
        let mut bitfield = BitField {
            payload: bytes.to_vec(),
            len,
        };
        for spare in len..bitfield.payload.len() * 8 {
            bitfield.clear_bit(spare);
        }
        Ok(bitfield)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Returns true if the bit at the given index is set. Out of range is false.
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let mask = 1 << (7 - index % 8);
        self.payload[index / 8] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.payload[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn unset(&mut self, index: usize) {
        if index < self.len {
            self.clear_bit(index);
        }
    }

    fn clear_bit(&mut self, index: usize) {
        self.payload[index / 8] &= !(1 << (7 - index % 8));
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count(&self) -> usize {
        self.payload.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> BitfieldIter {
        BitfieldIter {
            bitfield: self,
            index: 0,
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.is_set(index)
    }

    pub fn pieces(&self) -> Vec<usize> {
        self.iter()
            .enumerate()
            .filter(|&(_, b)| b)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }
}

pub struct BitfieldIter<'a> {
    bitfield: &'a BitField,
    index: usize,
}

impl<'a> Iterator for BitfieldIter<'a> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.index >= self.bitfield.len {
            return None;
        }
        let bit = self.bitfield.is_set(self.index);
        self.index += 1;
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_has() {
        let bf = BitField::from_payload(&[0b10101010, 0b01010101], 16).unwrap();
        assert!(bf.has_piece(0));
        assert!(!bf.has_piece(1));
        assert!(!bf.has_piece(7));
        assert!(!bf.has_piece(8));
        assert!(bf.has_piece(15));
        assert!(!bf.has_piece(16));
        assert_eq!(bf.count(), 8);
    }

    #[test]
    fn spare_bits_are_dropped() {
        let bf = BitField::from_payload(&[0xff, 0xff], 10).unwrap();
        assert_eq!(bf.count(), 10);
        assert!(bf.is_complete());
        assert_eq!(bf.as_bytes(), &[0xff, 0b1100_0000]);
    }

    #[test]
    fn wrong_payload_size_is_rejected() {
        assert!(BitField::from_payload(&[0xff], 10).is_err());
    }

    #[test]
    fn set_and_unset() {
        let mut bf = BitField::new(3);
        bf.set(2);
        bf.set(40);
        assert_eq!(bf.pieces(), vec![2]);
        bf.unset(2);
        assert_eq!(bf.count(), 0);
        assert!(BitField::full(3).is_complete());
    }
}
