//! On-disk model formats, little-endian throughout.
//!
//! Two formats live here:
//! - the layer-blob model file (`TMAI` magic): 256-byte header, a table of
//!   32-byte layer descriptors, then the concatenated layer payloads;
//! - the flat weights file (`TINYAIWT` magic) used by model export, carrying
//!   per-layer geometry plus weights-then-biases payloads.

use crate::error::{ModelError, ModelResult};

/// Model file magic, the ASCII bytes `T M A I` packed MSB-first.
pub const MAGIC: u32 = 0x544D_4149;

/// Current model file version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 256;

/// Size of one layer descriptor table entry.
pub const DESCRIPTOR_SIZE: usize = 32;

/// Offset of the NUL-padded model name inside the header.
const NAME_OFFSET: usize = 16;

/// Maximum model name length.
const NAME_LEN: usize = 32;

/// Storage precision of a layer, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Bits2,
    Bits4,
    Bits8,
    Bits16,
    Bits32,
}

impl Precision {
    /// Bit width as stored in the descriptor.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Precision::Bits2 => 2,
            Precision::Bits4 => 4,
            Precision::Bits8 => 8,
            Precision::Bits16 => 16,
            Precision::Bits32 => 32,
        }
    }

    /// Parse a descriptor's precision field.
    pub fn from_bits(bits: u32) -> ModelResult<Self> {
        match bits {
            2 => Ok(Precision::Bits2),
            4 => Ok(Precision::Bits4),
            8 => Ok(Precision::Bits8),
            16 => Ok(Precision::Bits16),
            32 => Ok(Precision::Bits32),
            other => Err(ModelError::invalid_file(format!(
                "unsupported precision: {other} bits"
            ))),
        }
    }
}

/// Parsed 256-byte model header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHeader {
    pub version: u32,
    pub layer_count: u32,
    pub name: String,
}

impl ModelHeader {
    /// Decode and validate a header block.
    pub fn decode(bytes: &[u8]) -> ModelResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ModelError::invalid_file(format!(
                "header truncated: {} of {HEADER_SIZE} bytes",
                bytes.len()
            )));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("sliced above"));
        if magic != MAGIC {
            return Err(ModelError::invalid_file(format!(
                "bad magic {magic:#010x}, expected {MAGIC:#010x}"
            )));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().expect("sliced above"));
        if version != VERSION {
            return Err(ModelError::invalid_file(format!(
                "unsupported version {version}, expected {VERSION}"
            )));
        }
        let layer_count = u32::from_le_bytes(bytes[8..12].try_into().expect("sliced above"));
        let name_bytes = &bytes[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

        Ok(Self {
            version,
            layer_count,
            name,
        })
    }

    /// Encode into a fresh 256-byte block, reserved bytes zeroed.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.layer_count.to_le_bytes());
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_LEN);
        out[NAME_OFFSET..NAME_OFFSET + len].copy_from_slice(&name[..len]);
        out
    }
}

/// One immutable layer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Position in the descriptor table.
    pub index: u32,
    /// Absolute byte offset of the payload from file start.
    pub offset: u32,
    /// Payload size in bytes.
    pub size: u32,
    /// Storage precision.
    pub precision: Precision,
}

impl LayerDescriptor {
    /// Decode one table entry.
    pub fn decode(index: u32, bytes: &[u8]) -> ModelResult<Self> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return Err(ModelError::invalid_file(format!(
                "descriptor {index} truncated"
            )));
        }
        let offset = u32::from_le_bytes(bytes[0..4].try_into().expect("sliced above"));
        let size = u32::from_le_bytes(bytes[4..8].try_into().expect("sliced above"));
        let precision_bits = u32::from_le_bytes(bytes[8..12].try_into().expect("sliced above"));
        Ok(Self {
            index,
            offset,
            size,
            precision: Precision::from_bits(precision_bits)?,
        })
    }

    /// Encode into one zero-padded table entry.
    #[must_use]
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.precision.bits().to_le_bytes());
        out
    }
}

/// In-memory builder producing complete model files, used by the export
/// path, the benchmark harness and the tests.
#[derive(Debug, Default)]
pub struct ModelFileBuilder {
    name: String,
    layers: Vec<(Precision, Vec<u8>)>,
}

impl ModelFileBuilder {
    /// Start a model with the given name (truncated to 32 bytes on disk).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    /// Append a layer payload.
    pub fn layer(mut self, precision: Precision, payload: Vec<u8>) -> Self {
        self.layers.push((precision, payload));
        self
    }

    /// Serialize header, descriptor table and payloads.
    pub fn build(self) -> ModelResult<Vec<u8>> {
        let layer_count = u32::try_from(self.layers.len())
            .map_err(|_| ModelError::invalid_argument("too many layers"))?;
        let header = ModelHeader {
            version: VERSION,
            layer_count,
            name: self.name,
        };

        let table_end = HEADER_SIZE + self.layers.len() * DESCRIPTOR_SIZE;
        let mut payload_offset = table_end;
        let mut out = Vec::with_capacity(table_end);
        out.extend_from_slice(&header.encode());

        for (index, (precision, payload)) in self.layers.iter().enumerate() {
            let descriptor = LayerDescriptor {
                index: index as u32,
                offset: u32::try_from(payload_offset)
                    .map_err(|_| ModelError::invalid_argument("model exceeds 4 GiB"))?,
                size: u32::try_from(payload.len())
                    .map_err(|_| ModelError::invalid_argument("layer exceeds 4 GiB"))?,
                precision: *precision,
            };
            out.extend_from_slice(&descriptor.encode());
            payload_offset += payload.len();
        }
        for (_, payload) in &self.layers {
            out.extend_from_slice(payload);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Flat weights file (`TINYAIWT`)
// ---------------------------------------------------------------------------

/// Weights-file magic.
pub const WEIGHTS_MAGIC: &[u8; 8] = b"TINYAIWT";

/// Weights-file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsHeader {
    pub model_type: u32,
    pub input_height: u32,
    pub input_width: u32,
    pub input_channels: u32,
    pub layer_count: u32,
    pub class_count: u32,
    pub quantized: bool,
}

/// One exported layer: geometry plus raw weight and bias bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsLayer {
    pub in_dim: u32,
    pub out_dim: u32,
    pub kernel: u32,
    pub stride: u32,
    pub padding: u32,
    pub weights: Vec<u8>,
    pub bias: Vec<u8>,
}

/// A complete flat weights file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsFile {
    pub header: WeightsHeader,
    pub layers: Vec<WeightsLayer>,
}

const WEIGHTS_HEADER_SIZE: usize = 8 + 7 * 4;
const WEIGHTS_RECORD_SIZE: usize = 7 * 4;

fn read_u32(bytes: &[u8], at: usize) -> ModelResult<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("4-byte slice")))
        .ok_or_else(|| ModelError::invalid_file("weights file truncated"))
}

impl WeightsFile {
    /// Serialize to bytes: header, per-layer records, then weights and
    /// biases per layer in order.
    pub fn to_bytes(&self) -> ModelResult<Vec<u8>> {
        if self.layers.len() != self.header.layer_count as usize {
            return Err(ModelError::invalid_argument(format!(
                "header says {} layers, got {}",
                self.header.layer_count,
                self.layers.len()
            )));
        }
        let mut out = Vec::with_capacity(WEIGHTS_HEADER_SIZE);
        out.extend_from_slice(WEIGHTS_MAGIC);
        for field in [
            self.header.model_type,
            self.header.input_height,
            self.header.input_width,
            self.header.input_channels,
            self.header.layer_count,
            self.header.class_count,
            u32::from(self.header.quantized),
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for layer in &self.layers {
            for field in [
                layer.in_dim,
                layer.out_dim,
                layer.kernel,
                layer.stride,
                layer.padding,
                u32::try_from(layer.weights.len())
                    .map_err(|_| ModelError::invalid_argument("weights exceed 4 GiB"))?,
                u32::try_from(layer.bias.len())
                    .map_err(|_| ModelError::invalid_argument("bias exceeds 4 GiB"))?,
            ] {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        for layer in &self.layers {
            out.extend_from_slice(&layer.weights);
            out.extend_from_slice(&layer.bias);
        }
        Ok(out)
    }

    /// Parse from bytes, validating magic and payload lengths.
    pub fn from_bytes(bytes: &[u8]) -> ModelResult<Self> {
        if bytes.len() < WEIGHTS_HEADER_SIZE {
            return Err(ModelError::invalid_file("weights file truncated"));
        }
        if &bytes[0..8] != WEIGHTS_MAGIC {
            return Err(ModelError::invalid_file("bad weights magic"));
        }
        let header = WeightsHeader {
            model_type: read_u32(bytes, 8)?,
            input_height: read_u32(bytes, 12)?,
            input_width: read_u32(bytes, 16)?,
            input_channels: read_u32(bytes, 20)?,
            layer_count: read_u32(bytes, 24)?,
            class_count: read_u32(bytes, 28)?,
            quantized: read_u32(bytes, 32)? != 0,
        };

        let count = header.layer_count as usize;
        let mut records = Vec::with_capacity(count);
        let mut at = WEIGHTS_HEADER_SIZE;
        for _ in 0..count {
            records.push((
                read_u32(bytes, at)?,
                read_u32(bytes, at + 4)?,
                read_u32(bytes, at + 8)?,
                read_u32(bytes, at + 12)?,
                read_u32(bytes, at + 16)?,
                read_u32(bytes, at + 20)? as usize,
                read_u32(bytes, at + 24)? as usize,
            ));
            at += WEIGHTS_RECORD_SIZE;
        }

        let mut layers = Vec::with_capacity(count);
        for (in_dim, out_dim, kernel, stride, padding, wlen, blen) in records {
            let weights = bytes
                .get(at..at + wlen)
                .ok_or_else(|| ModelError::invalid_file("weights payload truncated"))?
                .to_vec();
            at += wlen;
            let bias = bytes
                .get(at..at + blen)
                .ok_or_else(|| ModelError::invalid_file("bias payload truncated"))?
                .to_vec();
            at += blen;
            layers.push(WeightsLayer {
                in_dim,
                out_dim,
                kernel,
                stride,
                padding,
                weights,
                bias,
            });
        }

        Ok(Self { header, layers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_round_trip() {
        let header = ModelHeader {
            version: VERSION,
            layer_count: 12,
            name: "mobilenet-4bit".into(),
        };
        let decoded = ModelHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_magic_is_little_endian_tmai() {
        let header = ModelHeader {
            version: VERSION,
            layer_count: 0,
            name: String::new(),
        };
        let bytes = header.encode();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), MAGIC);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = ModelHeader {
            version: VERSION,
            layer_count: 0,
            name: String::new(),
        }
        .encode();
        bytes[0] ^= 0xFF;
        let err = ModelHeader::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = ModelHeader {
            version: VERSION,
            layer_count: 0,
            name: String::new(),
        }
        .encode();
        bytes[4] = 9;
        assert!(ModelHeader::decode(&bytes).is_err());
    }

    #[test]
    fn long_name_truncates_on_disk() {
        let header = ModelHeader {
            version: VERSION,
            layer_count: 1,
            name: "x".repeat(100),
        };
        let decoded = ModelHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.name.len(), 32);
    }

    #[test]
    fn descriptor_round_trip() {
        let desc = LayerDescriptor {
            index: 3,
            offset: 256 + 4 * 32,
            size: 5000,
            precision: Precision::Bits4,
        };
        let decoded = LayerDescriptor::decode(3, &desc.encode()).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn unknown_precision_rejected() {
        let mut bytes = LayerDescriptor {
            index: 0,
            offset: 256,
            size: 16,
            precision: Precision::Bits8,
        }
        .encode();
        bytes[8] = 7;
        assert!(LayerDescriptor::decode(0, &bytes).is_err());
    }

    #[test]
    fn builder_lays_out_payloads_contiguously() {
        let bytes = ModelFileBuilder::new("tiny")
            .layer(Precision::Bits4, vec![0xA1; 100])
            .layer(Precision::Bits8, vec![0xB2; 50])
            .build()
            .unwrap();

        let header = ModelHeader::decode(&bytes).unwrap();
        assert_eq!(header.layer_count, 2);

        let table = &bytes[HEADER_SIZE..];
        let d0 = LayerDescriptor::decode(0, table).unwrap();
        let d1 = LayerDescriptor::decode(1, &table[DESCRIPTOR_SIZE..]).unwrap();
        assert_eq!(d0.offset as usize, HEADER_SIZE + 2 * DESCRIPTOR_SIZE);
        assert_eq!(d1.offset, d0.offset + d0.size);
        assert!(bytes[d0.offset as usize..][..100].iter().all(|&b| b == 0xA1));
        assert!(bytes[d1.offset as usize..][..50].iter().all(|&b| b == 0xB2));
    }

    #[test]
    fn weights_file_round_trip() {
        let file = WeightsFile {
            header: WeightsHeader {
                model_type: 1,
                input_height: 32,
                input_width: 32,
                input_channels: 3,
                layer_count: 2,
                class_count: 10,
                quantized: true,
            },
            layers: vec![
                WeightsLayer {
                    in_dim: 3,
                    out_dim: 16,
                    kernel: 3,
                    stride: 1,
                    padding: 1,
                    weights: vec![0x11; 216],
                    bias: vec![0x22; 64],
                },
                WeightsLayer {
                    in_dim: 16,
                    out_dim: 10,
                    kernel: 1,
                    stride: 1,
                    padding: 0,
                    weights: vec![0x33; 80],
                    bias: vec![0x44; 40],
                },
            ],
        };
        let decoded = WeightsFile::from_bytes(&file.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn truncated_weights_file_rejected() {
        let file = WeightsFile {
            header: WeightsHeader {
                model_type: 0,
                input_height: 1,
                input_width: 1,
                input_channels: 1,
                layer_count: 1,
                class_count: 1,
                quantized: false,
            },
            layers: vec![WeightsLayer {
                in_dim: 1,
                out_dim: 1,
                kernel: 1,
                stride: 1,
                padding: 0,
                weights: vec![0; 64],
                bias: vec![0; 4],
            }],
        };
        let bytes = file.to_bytes().unwrap();
        assert!(WeightsFile::from_bytes(&bytes[..bytes.len() - 10]).is_err());
    }
}
