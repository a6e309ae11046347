use crate::bit_stream::{BitStreamReader, BitStreamWriter};

/// Uniform quantization of a float range onto an `nbits`-wide unsigned integer.
///
/// Values are clamped into `[mn, mx]`, mapped linearly onto `[0, 2^nbits - 1]` and
///  written fixed-width. The reconstruction error is bounded by half a
///  quantization step.
pub struct UniformQuantization {
    mn: f64,
    mx: f64,
    nbits: usize,
    qmx: u64,
}

impl UniformQuantization {
    pub fn new(mn: f64, mx: f64, nbits: usize) -> UniformQuantization {
        let nbits = nbits.clamp(1, 64);
        UniformQuantization {
            mn,
            mx,
            nbits,
            qmx: u64::MAX >> (64 - nbits as u32),
        }
    }

    pub fn step(&self) -> f64 {
        (self.mx - self.mn) / self.qmx as f64
    }

    pub fn write(&self, stream: &mut BitStreamWriter, value: f64) {
        let clamped = value.clamp(self.mn, self.mx);
        let quantized = ((clamped - self.mn) / (self.mx - self.mn) * self.qmx as f64) as u64;
        stream.write_unsigned_bits(quantized, self.nbits);
    }

    pub fn read(&self, stream: &mut BitStreamReader) -> anyhow::Result<f64> {
        let quantized: u64 = stream.read_unsigned_bits(self.nbits)?;
        Ok(self.mn + quantized as f64 / self.qmx as f64 * (self.mx - self.mn))
    }
}
