use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CodecError;

/// Element type tag for an [`NdArray`].
///
/// Names follow the common numeric-array conventions so that payloads remain
/// readable by non-Rust tooling that understands the same MessagePack layout.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A primitive that can be stored in an [`NdArray`].
pub trait Element: Copy + Send + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);

    /// Reads one element from exactly `DTYPE.size()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

/// An n-dimensional numeric array carried as shape + dtype + raw
/// little-endian bytes, row-major.
///
/// The raw bytes are preserved verbatim through the codec, so arrays
/// round-trip bit-exactly (NaN payloads included). Decoding goes through
/// [`NdArray::from_raw`], so a payload whose byte length disagrees with its
/// shape is rejected.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawNdArray")]
pub struct NdArray {
    shape: Vec<usize>,
    dtype: DType,
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
}

#[derive(Deserialize)]
struct RawNdArray {
    shape: Vec<usize>,
    dtype: DType,
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
}

impl TryFrom<RawNdArray> for NdArray {
    type Error = CodecError;

    fn try_from(raw: RawNdArray) -> Result<Self, Self::Error> {
        Self::from_raw(raw.shape, raw.dtype, raw.bytes)
    }
}

impl NdArray {
    /// Builds an array from row-major elements, checking that `shape`
    /// accounts for every element.
    pub fn from_vec<T: Element>(shape: Vec<usize>, data: Vec<T>) -> Result<Self, CodecError> {
        let mut bytes = Vec::with_capacity(data.len() * T::DTYPE.size());
        for v in data {
            v.write_le(&mut bytes);
        }
        Self::from_raw(shape, T::DTYPE, bytes)
    }

    /// Builds an array from already-encoded bytes.
    pub fn from_raw(shape: Vec<usize>, dtype: DType, bytes: Vec<u8>) -> Result<Self, CodecError> {
        let Some(expected) = shape
            .iter()
            .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        else {
            return Err(CodecError::ShapeOverflow(shape));
        };
        if expected != bytes.len() {
            return Err(CodecError::ShapeMismatch {
                shape,
                dtype: dtype.name(),
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { shape, dtype, bytes })
    }

    /// A one-dimensional array.
    pub fn vector<T: Element>(data: Vec<T>) -> Self {
        let len = data.len();
        let mut bytes = Vec::with_capacity(len * T::DTYPE.size());
        for v in data {
            v.write_le(&mut bytes);
        }
        Self {
            shape: vec![len],
            dtype: T::DTYPE,
            bytes,
        }
    }

    /// An array of `shape` with every element set to `value`.
    pub fn filled<T: Element>(shape: Vec<usize>, value: T) -> Self {
        let count = shape.iter().product::<usize>();
        let mut bytes = Vec::with_capacity(count * T::DTYPE.size());
        for _ in 0..count {
            value.write_le(&mut bytes);
        }
        Self {
            shape,
            dtype: T::DTYPE,
            bytes,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes the elements as `T`, failing if the stored dtype differs.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, CodecError> {
        if self.dtype != T::DTYPE {
            return Err(CodecError::DtypeMismatch {
                actual: self.dtype.name(),
                requested: T::DTYPE.name(),
            });
        }
        Ok(self
            .bytes
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }
}

/// A single sample value.
///
/// Scalars cover the common sensor readings; `Array` carries frames, channel
/// vectors and anything else shaped; `List`/`Map` allow structured samples
/// (e.g. a dictionary of named channels).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(NdArray),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

/// A sample as held in a stream buffer: the value plus the time at which
/// the owning node received it (seconds since the Unix epoch).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    pub time_s: f64,
    pub data: Value,
}

impl Sample {
    pub fn new(time_s: f64, data: impl Into<Value>) -> Self {
        Self {
            time_s,
            data: data.into(),
        }
    }
}

/// Samples for one device, keyed by stream name.
pub type DeviceSamples = BTreeMap<String, Value>;

/// One pull from a hardware collaborator: device name to that device's
/// samples, or `None` when the device had nothing this tick.
pub type Snapshot = BTreeMap<String, Option<DeviceSamples>>;

/// Wall-clock seconds since the Unix epoch.
pub fn now_s() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The flat set of named fields published on a data topic.
///
/// Producers fill `process_time_s` and `data`; pipelines may add their own
/// timing fields next to them. `data` maps device -> stream -> value; devices
/// absent from a snapshot are simply not present.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    pub const PROCESS_TIME: &'static str = "process_time_s";
    pub const DATA: &'static str = "data";

    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the message a producer publishes for one snapshot.
    pub fn from_snapshot(process_time_s: f64, snapshot: &Snapshot) -> Self {
        let data = snapshot
            .iter()
            .filter_map(|(device, streams)| {
                streams
                    .as_ref()
                    .map(|s| (device.clone(), Value::Map(s.clone())))
            })
            .collect();
        Self::new()
            .with(Self::PROCESS_TIME, Value::Float(process_time_s))
            .with(Self::DATA, Value::Map(data))
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn process_time_s(&self) -> Option<f64> {
        self.get(Self::PROCESS_TIME).and_then(Value::as_f64)
    }

    /// Reconstructs the snapshot carried in `data`.
    ///
    /// A message without `data` yields an empty snapshot; a `data` field that
    /// is not a map of maps is malformed.
    pub fn snapshot(&self) -> Result<Snapshot, CodecError> {
        let Some(data) = self.get(Self::DATA) else {
            return Ok(Snapshot::new());
        };
        let devices = data
            .as_map()
            .ok_or_else(|| CodecError::Malformed("`data` is not a map".to_string()))?;
        devices
            .iter()
            .map(|(device, streams)| match streams {
                Value::Map(s) => Ok((device.clone(), Some(s.clone()))),
                Value::Null => Ok((device.clone(), None)),
                _ => Err(CodecError::Malformed(format!(
                    "device `{}` does not carry a stream map",
                    device
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        let mut imu = DeviceSamples::new();
        imu.insert("acc".into(), Value::Array(NdArray::vector(vec![0.1f32, 9.8, -0.2])));
        imu.insert("temp".into(), Value::Float(31.5));
        let mut snap = Snapshot::new();
        snap.insert("imu".into(), Some(imu));
        snap.insert("camera".into(), None);
        snap
    }

    #[test]
    fn test_array_typed_access() {
        let arr = NdArray::from_vec(vec![2, 3], vec![1i32, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr.dtype(), DType::I32);
        assert_eq!(arr.len(), 6);
        assert_eq!(arr.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_array_shape_must_match_data() {
        let err = NdArray::from_vec(vec![2, 2], vec![1.0f64, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, CodecError::ShapeMismatch { expected: 32, actual: 24, .. }));
    }

    #[test]
    fn test_array_shape_overflow() {
        let err = NdArray::from_raw(vec![usize::MAX, 2], DType::U8, vec![]).unwrap_err();
        assert_eq!(err, CodecError::ShapeOverflow(vec![usize::MAX, 2]));
    }

    #[derive(Serialize)]
    struct WireArray {
        shape: Vec<usize>,
        dtype: DType,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    }

    #[test]
    fn test_decoding_checks_array_length() {
        let short = WireArray {
            shape: vec![3],
            dtype: DType::F64,
            bytes: vec![0; 16],
        };
        let payload = rmp_serde::to_vec_named(&short).unwrap();
        assert!(rmp_serde::from_slice::<NdArray>(&payload).is_err());

        let exact = WireArray {
            shape: vec![2],
            dtype: DType::F64,
            bytes: vec![0; 16],
        };
        let payload = rmp_serde::to_vec_named(&exact).unwrap();
        let arr: NdArray = rmp_serde::from_slice(&payload).unwrap();
        assert_eq!(arr.to_vec::<f64>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_array_dtype_mismatch() {
        let arr = NdArray::vector(vec![1u16, 2]);
        assert!(matches!(
            arr.to_vec::<f32>(),
            Err(CodecError::DtypeMismatch { actual: "uint16", requested: "float32" })
        ));
    }

    #[test]
    fn test_filled_array() {
        let arr = NdArray::filled(vec![4, 2], f32::NAN);
        assert_eq!(arr.len(), 8);
        assert!(arr.to_vec::<f32>().unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_message_from_snapshot_skips_absent_devices() {
        let msg = Message::from_snapshot(12.5, &snapshot());
        assert_eq!(msg.process_time_s(), Some(12.5));

        let back = msg.snapshot().unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.contains_key("imu"));
        assert_eq!(back["imu"], snapshot()["imu"]);
    }

    #[test]
    fn test_malformed_data_field() {
        let msg = Message::new().with(Message::DATA, 3i64);
        assert!(matches!(msg.snapshot(), Err(CodecError::Malformed(_))));

        let msg = Message::new().with(Message::DATA, Value::Map(
            [("imu".to_string(), Value::Bool(true))].into_iter().collect(),
        ));
        assert!(matches!(msg.snapshot(), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_message_without_data_is_empty_snapshot() {
        let msg = Message::new().with("delay_s", 0.01);
        assert!(msg.snapshot().unwrap().is_empty());
    }
}
