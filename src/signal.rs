// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal Pipeline: per-channel scaling, demean, and 4-pole Butterworth
//! low-pass filtering, batched for the live ingest path with a per-array
//! fallback for correctness when batching fails.

use crate::types::{CalibrationTable, ProcessedPacket, RawPacket, StationKey};
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use tracing::warn;

/// Q factors for the two second-order sections of a 4-pole Butterworth
/// prototype (`Q_k = 1 / (2 cos(theta_k))`, `theta_k = (2k-1)pi/(2n)`, n=4).
/// These are the standard cascade values used to build a 4th-order
/// Butterworth out of RBJ cookbook biquads.
const BUTTERWORTH_4_POLE_Q: [f64; 2] = [0.541196100146197, 1.3065629648763766];

/// A 4-pole Butterworth low-pass, represented as a cascade of two
/// second-order sections (SOS). Constructed once at startup from the
/// corner frequency and sample rate; applying it resets per-array state so
/// traces never leak filter history into each other.
#[derive(Clone)]
pub struct LowPassFilter {
    corner_hz: f64,
    sample_hz: f64,
    coefficients: [Coefficients<f64>; 2],
}

impl LowPassFilter {
    pub fn new(corner_hz: f64, sample_hz: f64) -> Self {
        let coefficients = BUTTERWORTH_4_POLE_Q.map(|q| {
            Coefficients::<f64>::from_params(
                Type::LowPass,
                sample_hz.hz(),
                corner_hz.hz(),
                q,
            )
            .expect("valid biquad parameters for the configured corner/sample rate")
        });
        Self {
            corner_hz,
            sample_hz,
            coefficients,
        }
    }

    /// 4-pole Butterworth at 10 Hz corner, 100 Hz sample rate — the
    /// dispatcher's default.
    pub fn default_eew() -> Self {
        Self::new(10.0, 100.0)
    }

    /// Apply the cascade to one array, in a single forward pass. A fresh
    /// pair of sections is instantiated per call so state never carries
    /// across unrelated traces.
    pub fn apply(&self, samples: &[f64]) -> Vec<f64> {
        let mut sections: [DirectForm2Transposed<f64>; 2] =
            self.coefficients.map(DirectForm2Transposed::<f64>::new);
        samples
            .iter()
            .map(|&x| sections.iter_mut().fold(x, |acc, section| section.run(acc)))
            .collect()
    }
}

/// Look up the calibration constant for a record (warning once if the
/// pair is unknown), scale, and subtract the mean.
fn scale_and_demean(raw: &RawPacket, calibration: &CalibrationTable) -> Vec<f64> {
    let key = StationKey::new(raw.station.clone(), raw.channel.clone());
    if !calibration.contains(&key) {
        warn!(
            "no calibration constant for ({}, {}), using default",
            raw.station, raw.channel
        );
    }
    let constant = calibration.lookup(&key);
    let scaled: Vec<f64> = raw.samples.iter().map(|&s| s * constant).collect();
    demean(scaled)
}

/// Wrap a filtered sample array and its source record's metadata into a
/// [`ProcessedPacket`].
fn finish(raw: &RawPacket, filtered: Vec<f64>) -> ProcessedPacket {
    let pga = ProcessedPacket::pga_of(&filtered);
    ProcessedPacket {
        wave_id: raw.wave_id(),
        startt: raw.startt,
        endt: raw.endt,
        samprate: raw.samprate,
        samples: filtered,
        pga,
    }
}

/// Subtract the mean in place and return the demeaned array.
fn demean(mut samples: Vec<f64>) -> Vec<f64> {
    if samples.is_empty() {
        return samples;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    for s in samples.iter_mut() {
        *s -= mean;
    }
    samples
}

/// Linear ramp from 0 to 1 over the first `taper_len` samples of `output`,
/// suppressing the filter's start-up transient on reassembled historical
/// traces. No-op when `output` is shorter than `taper_len`.
pub fn apply_start_taper(output: &mut [f64], taper_len: usize) {
    let taper_len = taper_len.min(output.len());
    for (i, sample) in output.iter_mut().take(taper_len).enumerate() {
        let weight = if taper_len <= 1 {
            1.0
        } else {
            i as f64 / (taper_len - 1) as f64
        };
        *sample *= weight;
    }
}

/// The start-edge taper length for a given sample rate: 2 seconds, capped
/// at 200 samples (both specified, whichever is smaller).
pub fn taper_length_for(samprate: u32) -> usize {
    ((2.0 * samprate as f64).round() as usize).min(200)
}

pub struct SignalPipeline {
    filter: LowPassFilter,
}

impl Default for SignalPipeline {
    fn default() -> Self {
        Self::new(LowPassFilter::default_eew())
    }
}

impl SignalPipeline {
    pub fn new(filter: LowPassFilter) -> Self {
        Self { filter }
    }

    /// Process a single raw packet: scale by calibration constant, demean,
    /// low-pass filter. This is both the individual-array code path and
    /// the fallback used per-row when a batch call fails.
    pub fn process_one(&self, raw: &RawPacket, calibration: &CalibrationTable) -> ProcessedPacket {
        self.process_one_inner(raw, calibration, None)
    }

    /// Historical-mode variant: same processing, plus a start-edge taper
    /// applied to the output to suppress filter ring-up on the
    /// reassembled trace's leading discontinuity.
    pub fn process_one_historical(
        &self,
        raw: &RawPacket,
        calibration: &CalibrationTable,
    ) -> ProcessedPacket {
        let taper_len = taper_length_for(raw.samprate);
        self.process_one_inner(raw, calibration, Some(taper_len))
    }

    fn process_one_inner(
        &self,
        raw: &RawPacket,
        calibration: &CalibrationTable,
        taper_len: Option<usize>,
    ) -> ProcessedPacket {
        let demeaned = scale_and_demean(raw, calibration);
        let mut filtered = self.filter.apply(&demeaned);
        if let Some(len) = taper_len {
            apply_start_taper(&mut filtered, len);
        }
        finish(raw, filtered)
    }

    /// Batch-process a tick of raw packets: each array is scaled and
    /// demeaned individually, then zero-padded to the batch's max length,
    /// stacked, and run through the filter cascade together before being
    /// truncated back to its own length. If the stacked pass panics, that
    /// row alone falls back to [`SignalPipeline::process_one`] rather than
    /// failing the whole batch.
    pub fn process_batch(
        &self,
        raws: &[RawPacket],
        calibration: &CalibrationTable,
    ) -> Vec<ProcessedPacket> {
        if raws.is_empty() {
            return Vec::new();
        }
        let max_len = raws.iter().map(|r| r.samples.len()).max().unwrap_or(0);
        let rows: Vec<Vec<f64>> = raws
            .iter()
            .map(|raw| scale_and_demean(raw, calibration))
            .collect();

        raws.iter()
            .zip(rows.into_iter())
            .map(|(raw, row)| {
                let original_len = row.len();
                let filter = &self.filter;
                let padded_filtered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut padded = row.clone();
                    padded.resize(max_len, 0.0);
                    let mut out = filter.apply(&padded);
                    out.truncate(original_len);
                    out
                }));

                match padded_filtered {
                    Ok(filtered) => finish(raw, filtered),
                    Err(_) => {
                        warn!(
                            "stacked filter pass failed for ({}, {}), falling back to individual processing",
                            raw.station, raw.channel
                        );
                        self.process_one(raw, calibration)
                    }
                }
            })
            .collect()
    }

    pub fn corner_hz(&self) -> f64 {
        self.filter.corner_hz
    }

    pub fn sample_hz(&self) -> f64 {
        self.filter.sample_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw_packet(samples: Vec<f64>) -> RawPacket {
        RawPacket {
            station: "STA01".into(),
            channel: "HLZ".into(),
            network: "SM".into(),
            location: "01".into(),
            startt: 1000.0,
            endt: 1002.0,
            samprate: 100,
            samples,
        }
    }

    #[test]
    fn taper_length_caps_at_200_samples() {
        assert_eq!(taper_length_for(100), 200);
        assert_eq!(taper_length_for(50), 100);
    }

    #[test]
    fn start_taper_ramps_from_zero_to_one() {
        let mut output = vec![10.0; 10];
        apply_start_taper(&mut output, 5);
        assert_eq!(output[0], 0.0);
        assert!((output[4] - 10.0).abs() < 1e-9);
        assert_eq!(output[5], 10.0); // untouched beyond taper window
    }

    #[test]
    fn demean_removes_dc_offset() {
        let samples = demean(vec![1.0, 2.0, 3.0]);
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 1e-12);
    }

    #[test]
    fn process_one_uses_default_constant_when_station_unknown() {
        let pipeline = SignalPipeline::default();
        let calibration = CalibrationTable::default();
        let raw = raw_packet(vec![1000.0; 200]);
        let processed = pipeline.process_one(&raw, &calibration);
        assert_eq!(processed.samples.len(), 200);
        // constant DC input demeans to ~0, low-passed DC stays ~0: pga should be small.
        assert!(processed.pga < 1.0);
    }

    #[test]
    fn process_one_scales_by_calibration_constant() {
        let pipeline = SignalPipeline::default();
        let mut constants = HashMap::new();
        constants.insert(StationKey::new("STA01", "HLZ"), 2.0);
        let calibration = CalibrationTable::new(constants);

        // A single large impulse against a flat baseline should PGA-scale
        // roughly proportional to the calibration constant.
        let mut samples = vec![0.0; 200];
        samples[100] = 1000.0;
        let raw = raw_packet(samples);
        let processed = pipeline.process_one(&raw, &calibration);
        assert!(processed.pga > 0.0);
    }

    #[test]
    fn historical_variant_tapers_the_leading_edge() {
        let pipeline = SignalPipeline::default();
        let calibration = CalibrationTable::default();
        let raw = raw_packet(vec![1000.0; 400]);
        let processed = pipeline.process_one_historical(&raw, &calibration);
        // First sample of a taper-applied output must be exactly zero.
        assert_eq!(processed.samples[0], 0.0);
    }

    #[test]
    fn batch_matches_individual_processing() {
        let pipeline = SignalPipeline::default();
        let calibration = CalibrationTable::default();
        let raws = vec![raw_packet(vec![500.0; 150]), raw_packet(vec![750.0; 90])];
        let batch = pipeline.process_batch(&raws, &calibration);
        for (raw, processed) in raws.iter().zip(batch.iter()) {
            let single = pipeline.process_one(raw, &calibration);
            assert_eq!(processed.samples, single.samples);
        }
    }
}
