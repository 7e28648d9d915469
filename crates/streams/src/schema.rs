use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pixel layout of a video stream, needed by writers and viewers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    Bgr,
    BayerRg8,
}

/// Static description of one stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamSchema {
    /// Element type tag, e.g. `"float32"` or `"json"`.
    pub data_type: String,
    /// Shape of one sample.
    pub sample_shape: Vec<usize>,
    pub sampling_rate_hz: f64,
    /// Track the actual arrival rate on every append.
    #[serde(default)]
    pub measure_rate: bool,
    /// Number of newest samples that are still provisional.
    #[serde(default)]
    pub timesteps_before_solidified: usize,
    /// Free-form notes, e.g. channel headings.
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_audio: bool,
    #[serde(default)]
    pub color_format: Option<ColorFormat>,
}

impl StreamSchema {
    pub fn new(data_type: impl Into<String>, sample_shape: Vec<usize>, sampling_rate_hz: f64) -> Self {
        Self {
            data_type: data_type.into(),
            sample_shape,
            sampling_rate_hz,
            measure_rate: false,
            timesteps_before_solidified: 0,
            notes: BTreeMap::new(),
            is_video: false,
            is_audio: false,
            color_format: None,
        }
    }

    pub fn measured(mut self) -> Self {
        self.measure_rate = true;
        self
    }

    pub fn solidify_after(mut self, timesteps: usize) -> Self {
        self.timesteps_before_solidified = timesteps;
        self
    }

    pub fn video(mut self, color_format: ColorFormat) -> Self {
        self.is_video = true;
        self.color_format = Some(color_format);
        self
    }

    pub fn audio(mut self) -> Self {
        self.is_audio = true;
        self
    }

    pub fn note(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.notes.insert(key.into(), value.into());
        self
    }

    /// Checks internal consistency; returns a description of the first problem.
    pub(crate) fn check(&self) -> Result<(), String> {
        if !self.sampling_rate_hz.is_finite() || self.sampling_rate_hz < 0.0 {
            return Err(format!("sampling rate {} is not a valid rate", self.sampling_rate_hz));
        }
        if self.measure_rate && self.sampling_rate_hz <= 0.0 {
            return Err("rate measurement needs a positive declared rate".to_string());
        }
        if self.is_video && self.color_format.is_none() {
            return Err("video stream without a color format".to_string());
        }
        if self.is_video && self.is_audio {
            return Err("stream cannot be both video and audio".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let schema = StreamSchema::new("uint8", vec![480, 640, 3], 30.0)
            .video(ColorFormat::Bgr)
            .measured()
            .solidify_after(2)
            .note("Data headings", "frame");
        assert!(schema.is_video);
        assert_eq!(schema.color_format, Some(ColorFormat::Bgr));
        assert_eq!(schema.timesteps_before_solidified, 2);
        assert!(schema.check().is_ok());
    }

    #[test]
    fn test_check_rejects_bad_rates() {
        assert!(StreamSchema::new("float32", vec![3], f64::NAN).check().is_err());
        assert!(StreamSchema::new("float32", vec![3], -1.0).check().is_err());
        assert!(StreamSchema::new("float32", vec![3], 0.0).measured().check().is_err());
        // Aperiodic streams may declare zero as long as the rate is not measured.
        assert!(StreamSchema::new("json", vec![1], 0.0).check().is_ok());
    }

    #[test]
    fn test_check_rejects_video_and_audio() {
        let schema = StreamSchema::new("uint8", vec![1], 30.0).video(ColorFormat::BayerRg8).audio();
        assert!(schema.check().is_err());
    }
}
