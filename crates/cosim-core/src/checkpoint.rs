//! Checkpoint record format: persisted terrain state.
//!
//! A checkpoint file is a fixed `CheckpointHeader` followed by the label
//! bytes and the state values as little-endian f64. The header names the
//! terrain variant that wrote it; a record is never loaded by a different
//! variant. Values are stored bit-exact, so save → load reproduces the state
//! without any rounding.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::payload::Vec3;
use crate::variant::TerrainType;

/// Label of the checkpoint written at the end of granular settling.
pub const SETTLED_LABEL: &str = "checkpoint_settled";

/// Label of the checkpoint written at the end of the run.
pub const END_LABEL: &str = "checkpoint_end";

pub const CHECKPOINT_MAGIC: [u8; 4] = *b"RCCK";
pub const CHECKPOINT_VERSION: u8 = 0x01;

/// Normalize a label: `checkpoint_end.dat` and `checkpoint_end` are the same.
pub fn normalize_label(label: &str) -> &str {
    label.strip_suffix(".dat").unwrap_or(label)
}

/// File name for a checkpoint label.
pub fn file_name(label: &str) -> String {
    format!("{}.dat", normalize_label(label))
}

// ── Record ────────────────────────────────────────────────────────────────────

/// Terrain state captured by a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TerrainState {
    /// Variants with no persistent state (rigid terrain).
    Empty,
    /// Row-major grid of values (SCM sinkage), `nx * ny` entries.
    HeightField {
        nx: u32,
        ny: u32,
        spacing: f64,
        origin: [f64; 2],
        values: Vec<f64>,
    },
    /// Particle set (granular, SPH).
    Particles {
        radius: f64,
        positions: Vec<Vec3>,
        velocities: Vec<Vec3>,
    },
}

impl TerrainState {
    fn kind(&self) -> u8 {
        match self {
            TerrainState::Empty => 0,
            TerrainState::HeightField { .. } => 1,
            TerrainState::Particles { .. } => 2,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TerrainState::Empty => "empty".to_string(),
            TerrainState::HeightField { nx, ny, .. } => format!("height field {nx}x{ny}"),
            TerrainState::Particles { positions, .. } => format!("{} particles", positions.len()),
        }
    }
}

/// A labelled terrain snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub label: String,
    pub terrain: TerrainType,
    /// Simulated time the snapshot was taken at.
    pub time: f64,
    pub state: TerrainState,
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed checkpoint file header.
///
/// Size: 92 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CheckpointHeader {
    pub magic: [u8; 4],
    pub version: u8,
    /// `TerrainType` byte of the writer.
    pub terrain: u8,
    /// 0 = empty, 1 = height field, 2 = particles.
    pub state_kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub label_len: u32,
    /// nx for height fields, particle count for particle sets.
    pub count_a: u32,
    /// ny for height fields, zero otherwise.
    pub count_b: u32,
    pub time: f64,
    /// Grid spacing or particle radius.
    pub scalar: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    /// Length of everything after the header.
    pub body_len: u64,
    /// BLAKE3 hash of everything after the header.
    pub content_hash: [u8; 32],
}

assert_eq_size!(CheckpointHeader, [u8; 92]);

pub const CHECKPOINT_HEADER_LEN: usize = std::mem::size_of::<CheckpointHeader>();

// ── Encoding ──────────────────────────────────────────────────────────────────

fn put_f64s(buf: &mut Vec<u8>, values: impl IntoIterator<Item = f64>) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Serialize a record into its on-disk bytes.
pub fn encode(record: &CheckpointRecord) -> Vec<u8> {
    let label = normalize_label(&record.label).as_bytes();
    let mut body = Vec::with_capacity(label.len());
    body.extend_from_slice(label);

    let (count_a, count_b, scalar, origin) = match &record.state {
        TerrainState::Empty => (0, 0, 0.0, [0.0, 0.0]),
        TerrainState::HeightField {
            nx,
            ny,
            spacing,
            origin,
            values,
        } => {
            put_f64s(&mut body, values.iter().copied());
            (*nx, *ny, *spacing, *origin)
        }
        TerrainState::Particles {
            radius,
            positions,
            velocities,
        } => {
            put_f64s(&mut body, positions.iter().flatten().copied());
            put_f64s(&mut body, velocities.iter().flatten().copied());
            (positions.len() as u32, 0, *radius, [0.0, 0.0])
        }
    };

    let header = CheckpointHeader {
        magic: CHECKPOINT_MAGIC,
        version: CHECKPOINT_VERSION,
        terrain: record.terrain.into(),
        state_kind: record.state.kind(),
        flags: 0,
        label_len: label.len() as u32,
        count_a,
        count_b,
        time: record.time,
        scalar,
        origin_x: origin[0],
        origin_y: origin[1],
        body_len: body.len() as u64,
        content_hash: *blake3::hash(&body).as_bytes(),
    };

    let mut out = Vec::with_capacity(CHECKPOINT_HEADER_LEN + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    out
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn read_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            f64::from_le_bytes(raw)
        })
        .collect()
}

fn to_vec3s(values: &[f64]) -> Vec<Vec3> {
    values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

/// Parse and verify checkpoint bytes.
pub fn decode(bytes: &[u8]) -> Result<CheckpointRecord, CheckpointError> {
    let header = CheckpointHeader::read_from_prefix(bytes).ok_or(CheckpointError::Truncated)?;
    if header.magic != CHECKPOINT_MAGIC {
        return Err(CheckpointError::BadMagic);
    }
    let version = header.version;
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnknownVersion(version));
    }

    let body = &bytes[CHECKPOINT_HEADER_LEN..];
    let body_len = header.body_len;
    if body.len() as u64 != body_len {
        return Err(CheckpointError::Truncated);
    }
    let expected = header.content_hash;
    if *blake3::hash(body).as_bytes() != expected {
        return Err(CheckpointError::HashMismatch);
    }

    let terrain_tag = header.terrain;
    let terrain = TerrainType::try_from(terrain_tag)
        .map_err(|_| CheckpointError::UnknownTerrain(terrain_tag))?;
    let label_len = header.label_len as usize;
    if label_len > body.len() {
        return Err(CheckpointError::Truncated);
    }
    let label = std::str::from_utf8(&body[..label_len])
        .map_err(|_| CheckpointError::BadLabel)?
        .to_string();
    if (body.len() - label_len) % 8 != 0 {
        return Err(CheckpointError::Truncated);
    }
    let values = read_f64s(&body[label_len..]);

    let count_a = header.count_a as usize;
    let count_b = header.count_b as usize;
    let state = match header.state_kind {
        0 => TerrainState::Empty,
        1 => {
            if values.len() != count_a * count_b {
                return Err(CheckpointError::CountMismatch {
                    expected: count_a * count_b,
                    got: values.len(),
                });
            }
            TerrainState::HeightField {
                nx: header.count_a,
                ny: header.count_b,
                spacing: header.scalar,
                origin: [header.origin_x, header.origin_y],
                values,
            }
        }
        2 => {
            if values.len() != count_a * 6 {
                return Err(CheckpointError::CountMismatch {
                    expected: count_a * 6,
                    got: values.len(),
                });
            }
            let (pos, vel) = values.split_at(count_a * 3);
            TerrainState::Particles {
                radius: header.scalar,
                positions: to_vec3s(pos),
                velocities: to_vec3s(vel),
            }
        }
        other => return Err(CheckpointError::UnknownStateKind(other)),
    };

    Ok(CheckpointRecord {
        label,
        terrain,
        time: header.time,
        state,
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint truncated")]
    Truncated,

    #[error("not a checkpoint file (bad magic)")]
    BadMagic,

    #[error("unknown checkpoint version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("checkpoint content hash mismatch")]
    HashMismatch,

    #[error("unknown terrain tag in checkpoint: {0}")]
    UnknownTerrain(u8),

    #[error("unknown state kind in checkpoint: {0}")]
    UnknownStateKind(u8),

    #[error("checkpoint label is not valid UTF-8")]
    BadLabel,

    #[error("checkpoint value count mismatch: expected {expected}, got {got}")]
    CountMismatch { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particles() -> CheckpointRecord {
        CheckpointRecord {
            label: SETTLED_LABEL.to_string(),
            terrain: TerrainType::GranularCpu,
            time: 0.4,
            state: TerrainState::Particles {
                radius: 0.02,
                positions: vec![[0.1, -0.2, 0.02], [1.0 / 3.0, f64::MIN_POSITIVE, 7.25e-9]],
                velocities: vec![[0.0, 0.0, -1e-12], [3.5, -0.0, 2.0]],
            },
        }
    }

    #[test]
    fn particle_state_survives_bit_exact() {
        let record = particles();
        let decoded = decode(&encode(&record)).unwrap();
        assert_eq!(decoded, record);
        if let (
            TerrainState::Particles { positions: a, .. },
            TerrainState::Particles { positions: b, .. },
        ) = (&decoded.state, &record.state)
        {
            for (pa, pb) in a.iter().zip(b) {
                for k in 0..3 {
                    assert_eq!(pa[k].to_bits(), pb[k].to_bits());
                }
            }
        }
    }

    #[test]
    fn height_field_and_empty_states_decode() {
        let hf = CheckpointRecord {
            label: "checkpoint_end.dat".into(),
            terrain: TerrainType::Scm,
            time: 1.5,
            state: TerrainState::HeightField {
                nx: 2,
                ny: 3,
                spacing: 0.05,
                origin: [-5.0, -0.5],
                values: vec![0.0, 0.01, 0.02, 0.03, 0.04, 0.05],
            },
        };
        let decoded = decode(&encode(&hf)).unwrap();
        assert_eq!(decoded.label, END_LABEL);
        assert_eq!(decoded.state, hf.state);

        let empty = CheckpointRecord {
            label: END_LABEL.into(),
            terrain: TerrainType::Rigid,
            time: 0.0,
            state: TerrainState::Empty,
        };
        assert_eq!(decode(&encode(&empty)).unwrap(), empty);
    }

    #[test]
    fn corrupted_checkpoint_is_rejected() {
        let mut bytes = encode(&particles());
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(decode(&bytes).unwrap_err(), CheckpointError::HashMismatch);
        assert_eq!(decode(&bytes[..20]).unwrap_err(), CheckpointError::Truncated);
    }

    #[test]
    fn labels_normalize_to_dat_files() {
        assert_eq!(file_name("checkpoint_end.dat"), "checkpoint_end.dat");
        assert_eq!(file_name(SETTLED_LABEL), "checkpoint_settled.dat");
    }
}
