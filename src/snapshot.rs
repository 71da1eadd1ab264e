//! Model snapshots: a CBOR-serialisable map of named tensors, with
//! atomic on-disk persistence and restore-into-place support.
//!
//! The orchestrator captures a snapshot whenever the monitored metric
//! improves, keeps it as the rollback point for divergence recovery, and
//! best-effort writes it to the configured save path.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use ciborium::{de, ser};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Current on-disk version.  Bump if the binary layout changes.
pub const SNAPSHOT_VERSION: u8 = 1;

/* --------------------------------------------------------------------- */
/*  Error type                                                           */

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cbor: {0}")]
    Cbor(String),
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("unsupported tensor dtype \"{0}\"")]
    DType(String),
    #[error("snapshot has no tensor \"{0}\"")]
    MissingTensor(String),
    #[error("mutex poisoned: {0}")]
    Poison(String),
}

fn write_cbor<W: Write, T: Serialize + ?Sized>(w: W, val: &T) -> Result<(), SnapshotError> {
    ser::into_writer(val, w).map_err(|e| SnapshotError::Cbor(e.to_string()))
}
fn read_cbor<R: Read, T: DeserializeOwned>(r: R) -> Result<T, SnapshotError> {
    de::from_reader(r).map_err(|e| SnapshotError::Cbor(e.to_string()))
}

/* --------------------------------------------------------------------- */
/*  Tensor wrapper                                                       */

/// Serializable tensor container: raw little-endian bytes plus shape and
/// dtype, reconstructable into a candle tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorData {
    pub bytes: Vec<u8>,
    pub dims: Vec<usize>,
    pub d_type: String,
}

impl TryFrom<&Var> for TensorData {
    type Error = SnapshotError;

    fn try_from(var: &Var) -> Result<Self, Self::Error> {
        let mut bytes = Vec::new();
        var.write_bytes(&mut bytes)?;
        Ok(TensorData {
            bytes,
            dims: var.shape().dims().to_vec(),
            d_type: var.dtype().as_str().to_owned(),
        })
    }
}

impl TryFrom<&TensorData> for Tensor {
    type Error = SnapshotError;

    fn try_from(td: &TensorData) -> Result<Self, Self::Error> {
        let dt = match td.d_type.as_str() {
            "f32" => DType::F32,
            "f16" => DType::F16,
            "bf16" => DType::BF16,
            "f64" => DType::F64,
            "u8" => DType::U8,
            "u32" => DType::U32,
            "i64" => DType::I64,
            other => return Err(SnapshotError::DType(other.to_owned())),
        };
        Ok(Tensor::from_raw_buffer(&td.bytes, dt, &td.dims, &Device::Cpu)?)
    }
}

/* --------------------------------------------------------------------- */
/*  Snapshot                                                             */

/// A point-in-time copy of every trainable parameter, in deterministic
/// (sorted-by-name) order.
#[derive(Serialize, Deserialize)]
pub struct ModelSnapshot {
    version: u8,
    pub tensors: IndexMap<String, TensorData>,
}

impl ModelSnapshot {
    pub fn new(tensors: IndexMap<String, TensorData>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tensors,
        }
    }
}

impl SnapshotSave for ModelSnapshot {}
impl SnapshotLoad for ModelSnapshot {}

/* --------------------------------------------------------------------- */
/*  Persistence traits                                                   */

/// Atomic CBOR persistence for snapshot-like values.
pub trait SnapshotSave: Serialize {
    /// Atomically write CBOR to `path`.
    /// Uses "`<file>.tmp` → rename" on the same filesystem for safety.
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");

        {
            let f = File::create(&tmp)?;
            let mut bw = BufWriter::new(f);
            write_cbor(&mut bw, self)?;
            bw.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Serialize into an in-memory CBOR buffer.
    fn save_to_buffer(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut buf = Vec::new();
        write_cbor(&mut buf, self)?;
        Ok(buf)
    }
}

/// Load counterpart of [`SnapshotSave`].
pub trait SnapshotLoad: DeserializeOwned + Sized {
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let f = File::open(path)?;
        read_cbor(BufReader::new(f))
    }

    fn load_from_buffer(buf: &[u8]) -> Result<Self, SnapshotError> {
        read_cbor(BufReader::new(buf))
    }
}

/* --------------------------------------------------------------------- */
/*  Checkpoint trait                                                     */

/// Anything whose parameters can be captured into a [`ModelSnapshot`] and
/// restored from one. Restore happens only between batches, so the
/// implementation sees no concurrent parameter updates.
pub trait Checkpoint {
    fn capture(&self) -> Result<ModelSnapshot, SnapshotError>;
    fn restore(&self, snapshot: &ModelSnapshot) -> Result<(), SnapshotError>;
}

impl Checkpoint for VarMap {
    fn capture(&self) -> Result<ModelSnapshot, SnapshotError> {
        let guard = self
            .data()
            .lock()
            .map_err(|e| SnapshotError::Poison(e.to_string()))?;

        let mut names: Vec<&String> = guard.keys().collect();
        names.sort();

        let mut tensors = IndexMap::with_capacity(names.len());
        for name in names {
            let var = guard
                .get(name)
                .ok_or_else(|| SnapshotError::MissingTensor(name.clone()))?;
            tensors.insert(name.clone(), TensorData::try_from(var)?);
        }
        Ok(ModelSnapshot::new(tensors))
    }

    fn restore(&self, snapshot: &ModelSnapshot) -> Result<(), SnapshotError> {
        let guard = self
            .data()
            .lock()
            .map_err(|e| SnapshotError::Poison(e.to_string()))?;

        for (name, var) in guard.iter() {
            let td = snapshot
                .tensors
                .get(name)
                .ok_or_else(|| SnapshotError::MissingTensor(name.clone()))?;
            let t = Tensor::try_from(td)?.to_device(var.device())?;
            var.set(&t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_through_cbor() {
        let mut tensors = IndexMap::new();
        tensors.insert(
            "fc.weight".to_owned(),
            TensorData {
                bytes: 1.0f32.to_le_bytes().to_vec(),
                dims: vec![1, 1],
                d_type: "f32".to_owned(),
            },
        );
        let snap = ModelSnapshot::new(tensors);

        let buf = snap.save_to_buffer().unwrap();
        let back = ModelSnapshot::load_from_buffer(&buf).unwrap();
        assert_eq!(back.tensors.len(), 1);
        assert_eq!(back.tensors["fc.weight"].dims, vec![1, 1]);
    }

    #[test]
    fn tensor_data_rejects_unknown_dtypes() {
        let td = TensorData {
            bytes: vec![],
            dims: vec![0],
            d_type: "q4".to_owned(),
        };
        assert!(matches!(
            Tensor::try_from(&td),
            Err(SnapshotError::DType(_))
        ));
    }
}
