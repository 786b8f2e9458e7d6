//! Energy-based voice-activity detection.
//!
//! The detector consumes raw PCM chunks in arrival order and reports edge
//! decisions; it never touches session state. Silence is timer-driven: when
//! a speech region goes quiet the detector asks the caller to arm a one-shot
//! deadline, and only confirms `speech_ended` when the caller reports that
//! the deadline elapsed with no loud frame in between.

use crate::error::FrameError;

/// VAD tunables.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Normalized RMS energy threshold in [0,1]. Energy strictly greater
    /// than the threshold counts as speech; equality does not.
    pub threshold: f32,
    /// Silence run length that closes an utterance.
    pub silence_window_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            silence_window_ms: 1000,
        }
    }
}

/// Per-frame decision handed back to the session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadUpdate {
    /// First loud frame after silence.
    SpeechStarted,
    /// Loud frame inside an ongoing speech region. Any pending silence
    /// deadline is stale and must be disarmed.
    SpeechContinuing,
    /// First quiet frame after speech: arm the silence deadline.
    ArmSilence,
    /// Nothing to act on.
    Quiet,
}

/// Stateful energy detector for one session.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    speaking: bool,
    silence_armed: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speaking: false,
            silence_armed: false,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Root-mean-square energy of a 16-bit signed LE PCM chunk, normalized
    /// to [0,1]. Empty input has zero energy.
    pub fn frame_energy(pcm: &[u8]) -> Result<f32, FrameError> {
        if pcm.len() % 2 != 0 {
            return Err(FrameError::OddLength(pcm.len()));
        }
        if pcm.is_empty() {
            return Ok(0.0);
        }

        let mut sum_squares = 0.0f64;
        for sample in pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]) as f64 / 32768.0;
            sum_squares += value * value;
        }
        Ok((sum_squares / (pcm.len() / 2) as f64).sqrt() as f32)
    }

    /// Feed one inbound frame and report the edge decision.
    ///
    /// Empty frames are ignored without altering detector state.
    pub fn observe(&mut self, pcm: &[u8]) -> Result<VadUpdate, FrameError> {
        if pcm.is_empty() {
            return Ok(VadUpdate::Quiet);
        }
        let energy = Self::frame_energy(pcm)?;

        if energy > self.config.threshold {
            let started = !self.speaking;
            self.speaking = true;
            self.silence_armed = false;
            Ok(if started {
                VadUpdate::SpeechStarted
            } else {
                VadUpdate::SpeechContinuing
            })
        } else if self.speaking && !self.silence_armed {
            self.silence_armed = true;
            Ok(VadUpdate::ArmSilence)
        } else {
            Ok(VadUpdate::Quiet)
        }
    }

    /// Called when the armed silence deadline fires. Returns true when the
    /// region is confirmed over (a `speech_ended` edge).
    pub fn silence_elapsed(&mut self) -> bool {
        if self.speaking && self.silence_armed {
            self.speaking = false;
            self.silence_armed = false;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PCM chunk where every sample has the given amplitude.
    fn tone(amplitude: i16, samples: usize) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            pcm.extend_from_slice(&amplitude.to_le_bytes());
        }
        pcm
    }

    #[test]
    fn energy_of_silence_is_zero() {
        let pcm = tone(0, 160);
        assert_eq!(VoiceActivityDetector::frame_energy(&pcm).unwrap(), 0.0);
    }

    #[test]
    fn energy_of_full_scale_is_one() {
        let pcm = tone(i16::MIN, 160);
        let energy = VoiceActivityDetector::frame_energy(&pcm).unwrap();
        assert!((energy - 1.0).abs() < 1e-4, "energy={energy}");
    }

    #[test]
    fn odd_length_frame_is_rejected() {
        assert_eq!(
            VoiceActivityDetector::frame_energy(&[0u8; 3]),
            Err(FrameError::OddLength(3))
        );
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert!(vad.observe(&[0u8; 5]).is_err());
        assert!(!vad.is_speaking());
    }

    #[test]
    fn empty_frame_is_ignored() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.observe(&tone(8000, 160)).unwrap();
        assert!(vad.is_speaking());
        assert_eq!(vad.observe(&[]).unwrap(), VadUpdate::Quiet);
        assert!(vad.is_speaking());
    }

    #[test]
    fn speech_edges_fire_once() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert_eq!(vad.observe(&tone(8000, 160)).unwrap(), VadUpdate::SpeechStarted);
        assert_eq!(
            vad.observe(&tone(8000, 160)).unwrap(),
            VadUpdate::SpeechContinuing
        );
    }

    #[test]
    fn silence_arms_once_then_stays_quiet() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.observe(&tone(8000, 160)).unwrap();
        assert_eq!(vad.observe(&tone(0, 160)).unwrap(), VadUpdate::ArmSilence);
        assert_eq!(vad.observe(&tone(0, 160)).unwrap(), VadUpdate::Quiet);
        assert!(vad.silence_elapsed());
        assert!(!vad.is_speaking());
    }

    #[test]
    fn loud_frame_disarms_pending_silence() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.observe(&tone(8000, 160)).unwrap();
        vad.observe(&tone(0, 160)).unwrap();
        assert_eq!(
            vad.observe(&tone(8000, 160)).unwrap(),
            VadUpdate::SpeechContinuing
        );
        // The deadline that was armed before the loud frame is stale now.
        assert!(!vad.silence_elapsed());
        assert!(vad.is_speaking());
    }

    #[test]
    fn threshold_equality_counts_as_silence() {
        // Constant amplitude a gives RMS exactly a/32768.
        let amplitude = 328i16; // 328/32768 ≈ 0.010009...
        let energy =
            VoiceActivityDetector::frame_energy(&tone(amplitude, 160)).unwrap();
        let mut vad = VoiceActivityDetector::new(VadConfig {
            threshold: energy,
            silence_window_ms: 1000,
        });
        assert_eq!(vad.observe(&tone(amplitude, 160)).unwrap(), VadUpdate::Quiet);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn silence_without_speech_never_ends() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert_eq!(vad.observe(&tone(0, 160)).unwrap(), VadUpdate::Quiet);
        assert!(!vad.silence_elapsed());
    }
}
