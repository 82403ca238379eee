use rt_abi::{ELEMENT_TYPE_BYREF, ELEMENT_TYPE_VAR};

/// Appends a method signature blob into a buffer sized up front. The length
/// written must match the prediction exactly.
#[derive(Debug)]
pub struct SignatureBuilder {
    buf: Vec<u8>,
    predicted: usize,
}

impl SignatureBuilder {
    pub fn with_predicted_len(predicted: usize) -> Self {
        Self {
            buf: Vec::with_capacity(predicted),
            predicted,
        }
    }

    /// Encoded size of `value` as a compressed unsigned integer.
    pub fn compressed_len(value: u32) -> usize {
        match value {
            0..=0x7F => 1,
            0x80..=0x3FFF => 2,
            _ => 4,
        }
    }

    pub fn calling_convention(&mut self, flags: u8) -> &mut Self {
        self.buf.push(flags);
        self
    }

    pub fn compressed(&mut self, value: u32) -> &mut Self {
        match Self::compressed_len(value) {
            1 => self.buf.push(value as u8),
            2 => self
                .buf
                .extend_from_slice(&((value as u16) | 0x8000).to_be_bytes()),
            _ => self
                .buf
                .extend_from_slice(&((value & 0x1FFF_FFFF) | 0xC000_0000).to_be_bytes()),
        }
        self
    }

    pub fn element(&mut self, code: u8) -> &mut Self {
        self.buf.push(code);
        self
    }

    pub fn elements(&mut self, code: u8, count: u32) -> &mut Self {
        for _ in 0..count {
            self.buf.push(code);
        }
        self
    }

    /// Class generic parameter `index`, used so one signature serves every
    /// instantiation that shares the method.
    pub fn type_var(&mut self, index: u32) -> &mut Self {
        self.buf.push(ELEMENT_TYPE_VAR);
        self.compressed(index)
    }

    pub fn by_ref(&mut self) -> &mut Self {
        self.buf.push(ELEMENT_TYPE_BYREF);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        assert_eq!(
            self.buf.len(),
            self.predicted,
            "signature length does not match its prediction"
        );
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_integers_use_ecma_widths() {
        let mut builder = SignatureBuilder::with_predicted_len(7);
        builder.compressed(0x03).compressed(0x80).compressed(0x4000);
        assert_eq!(builder.finish(), vec![0x03, 0x80, 0x80, 0xC0, 0x00, 0x40, 0x00]);
    }

    #[test]
    #[should_panic(expected = "prediction")]
    fn misprediction_is_caught() {
        let mut builder = SignatureBuilder::with_predicted_len(3);
        builder.element(0x01);
        builder.finish();
    }
}
