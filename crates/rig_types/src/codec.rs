//! Frames and payload encoding.
//!
//! Every message on the fabric is a two-part frame: a topic string and an
//! opaque binary payload. Data payloads are MessagePack maps of named fields;
//! the end-of-stream sentinel reuses the data topic with [`END_MARKER`] as
//! its payload.

use bytes::Bytes;

use crate::comms::{connection_topic, data_topic, END_MARKER};
use crate::data::Message;
use crate::error::CodecError;

/// Serializes a message to its payload bytes.
pub fn serialize(msg: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Deserializes payload bytes produced by [`serialize`].
pub fn deserialize(payload: &[u8]) -> Result<Message, CodecError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// The decoded meaning of a data-topic payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Data(Message),
    End,
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        match self {
            Envelope::Data(msg) => Ok(Bytes::from(serialize(msg)?)),
            Envelope::End => Ok(Bytes::from_static(END_MARKER)),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        if payload == END_MARKER {
            return Ok(Envelope::End);
        }
        deserialize(payload).map(Envelope::Data)
    }
}

/// A two-part frame as it travels through the fabric.
///
/// The payload is reference counted so fan-out to many subscribers does not
/// copy it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// A data frame for `tag`'s topic.
    pub fn data(tag: &str, msg: &Message) -> Result<Self, CodecError> {
        Ok(Self::new(data_topic(tag), Envelope::Data(msg.clone()).encode()?))
    }

    /// A frame for `tag`'s connection topic.
    pub fn connection(tag: &str, msg: &Message) -> Result<Self, CodecError> {
        Ok(Self::new(connection_topic(tag), Envelope::Data(msg.clone()).encode()?))
    }

    /// The END frame for `tag`'s topic.
    pub fn end(tag: &str) -> Self {
        Self::new(data_topic(tag), Bytes::from_static(END_MARKER))
    }

    pub fn is_end(&self) -> bool {
        self.payload.as_ref() == END_MARKER
    }

    pub fn envelope(&self) -> Result<Envelope, CodecError> {
        Envelope::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DeviceSamples, NdArray, Snapshot, Value};

    #[test]
    fn test_arrays_survive_the_codec_bit_exact() {
        let frame_px = NdArray::from_vec(vec![2, 2, 3], (0u8..12).collect()).unwrap();
        let weird = NdArray::vector(vec![f64::NAN, -0.0, f64::INFINITY, 1e-308]);

        let mut cam = DeviceSamples::new();
        cam.insert("frame".into(), Value::Array(frame_px.clone()));
        cam.insert("raw".into(), Value::Array(weird.clone()));
        let mut snap = Snapshot::new();
        snap.insert("cam0".into(), Some(cam));

        let msg = Message::from_snapshot(1.25, &snap);
        let decoded = deserialize(&serialize(&msg).unwrap()).unwrap();

        let back = decoded.snapshot().unwrap();
        let cam = back["cam0"].as_ref().unwrap();
        let frame_back = cam["frame"].as_array().unwrap();
        assert_eq!(frame_back, &frame_px);
        let weird_back = cam["raw"].as_array().unwrap();
        assert_eq!(weird_back.shape(), weird.shape());
        assert_eq!(weird_back.dtype(), weird.dtype());
        assert_eq!(weird_back.as_bytes(), weird.as_bytes());
        assert_eq!(decoded.process_time_s(), Some(1.25));
    }

    #[test]
    fn test_end_frame() {
        let end = Frame::end("emg");
        assert_eq!(end.topic, "emg.data");
        assert!(end.is_end());
        assert_eq!(end.envelope().unwrap(), Envelope::End);
    }

    #[test]
    fn test_data_frame_is_not_end() {
        let msg = Message::new().with("process_time_s", 3.0);
        let frame = Frame::data("emg", &msg).unwrap();
        assert!(!frame.is_end());
        assert_eq!(frame.envelope().unwrap(), Envelope::Data(msg));
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        assert!(matches!(
            Envelope::decode(&[0xc1, 0x00, 0x13]),
            Err(CodecError::Decode(_))
        ));
    }
}
