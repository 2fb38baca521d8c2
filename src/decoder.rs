use crate::{
    CalibrationError, CalibrationTable, DecodeError, FrameHeader, LinkConfig, Malformed, RawFrame,
    WaveformRecord, HEADER_BYTES,
};
use ndarray::Array2;
use std::sync::Arc;

/// Decodes frames against one acquisition configuration and calibration.
///
/// Holds nothing but read-only state, so decoding a frame never depends on
/// frames seen before it.
#[derive(Debug, Clone)]
pub struct Decoder {
    config: LinkConfig,
    calibration: Arc<CalibrationTable>,
}

impl Decoder {
    /// Fails if the table cannot calibrate every configured channel over
    /// the configured sample depth.
    pub fn new(
        config: LinkConfig,
        calibration: Arc<CalibrationTable>,
    ) -> Result<Self, CalibrationError> {
        if calibration.n_cells() < config.sample_depth {
            return Err(CalibrationError::TooFewCells {
                n_cells: calibration.n_cells(),
                depth: config.sample_depth,
            });
        }
        for ch in config.channel_mask.channels() {
            if calibration.channel(ch).is_none() {
                return Err(CalibrationError::MissingChannel(ch));
            }
        }
        Ok(Self {
            config,
            calibration,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn calibration(&self) -> &Arc<CalibrationTable> {
        &self.calibration
    }

    pub fn decode(&self, frame: &RawFrame) -> Result<WaveformRecord, DecodeError> {
        decode(frame, &self.config, &self.calibration)
    }
}

/// Turn one raw frame into a calibrated record.
///
/// Sample `i` was taken in cell `(stop_cell + i) % n_cells`. Amplitudes are
/// `(raw - offset) * gain` of that cell; the time axis starts at 0 and
/// advances by the width of each cell passed.
pub fn decode(
    frame: &RawFrame,
    config: &LinkConfig,
    calibration: &CalibrationTable,
) -> Result<WaveformRecord, DecodeError> {
    let malformed = |reason| DecodeError::Malformed {
        sequence: frame.sequence,
        reason,
    };
    let header = FrameHeader::parse(frame.sequence, &frame.payload)?;

    if header.channel_mask != config.channel_mask {
        return Err(malformed(Malformed::ChannelMask {
            expected: config.channel_mask.0,
            found: header.channel_mask.0,
        }));
    }
    let depth = config.sample_depth;
    if header.sample_depth as usize != depth {
        return Err(malformed(Malformed::SampleDepth {
            expected: depth,
            found: header.sample_depth as usize,
        }));
    }
    let channels = config.channel_mask.channels();
    let expected = channels.len() * depth * 2;
    let actual = frame.payload.len() - HEADER_BYTES;
    if header.payload_len as usize != expected || actual != expected {
        return Err(malformed(Malformed::PayloadLength {
            declared: header.payload_len as usize,
            expected,
            actual,
        }));
    }
    let n_cells = calibration.n_cells();
    if header.stop_cell as usize >= n_cells {
        return Err(malformed(Malformed::StopCell {
            stop_cell: header.stop_cell,
            n_cells,
        }));
    }

    let stop = header.stop_cell as usize;
    let payload = &frame.payload[HEADER_BYTES..];
    let mut time_ns = Array2::<f32>::zeros((channels.len(), depth));
    let mut amplitude_mv = Array2::<f32>::zeros((channels.len(), depth));

    for (row, &ch) in channels.iter().enumerate() {
        let Some(cal) = calibration.channel(ch) else {
            return Err(malformed(Malformed::Uncalibrated(ch)));
        };
        let raw = &payload[row * depth * 2..(row + 1) * depth * 2];
        let mut t = 0f64;
        for i in 0..depth {
            let cell = (stop + i) % n_cells;
            let count = u16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]) as f32;
            amplitude_mv[[row, i]] = (count - cal.offsets[cell]) * cal.gains[cell];
            time_ns[[row, i]] = t as f32;
            t += cal.bin_widths[cell] as f64;
        }
    }

    Ok(WaveformRecord {
        event_id: frame.sequence,
        trigger_counter: header.trigger_counter,
        device_time_ns: header.device_time_ns,
        host_time_ns: frame.host_time_ns,
        stop_cell: header.stop_cell,
        channels,
        time_ns,
        amplitude_mv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode_frame, ChannelCalibration, ChannelMask, TriggerMode};
    use std::collections::BTreeMap;

    const CELLS: usize = 8;

    fn table() -> Arc<CalibrationTable> {
        let channels = [0u8, 2]
            .into_iter()
            .map(|ch| {
                (
                    ch,
                    ChannelCalibration {
                        offsets: (0..CELLS).map(|c| c as f32).collect(),
                        gains: vec![0.5; CELLS],
                        bin_widths: (0..CELLS).map(|c| 1.0 + c as f32).collect(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        Arc::new(CalibrationTable::new("test", 1, CELLS, channels).unwrap())
    }

    fn config() -> LinkConfig {
        LinkConfig {
            channel_mask: ChannelMask(0b101),
            trigger_mode: TriggerMode::External,
            sample_depth: 4,
        }
    }

    fn frame(mask: u8, stop_cell: u16, samples: &[u16]) -> RawFrame {
        let header = FrameHeader {
            channel_mask: ChannelMask(mask),
            sample_depth: 4,
            trigger_counter: 77,
            device_time_ns: 1_000,
            stop_cell,
            payload_len: 0,
        };
        RawFrame {
            sequence: 5,
            host_time_ns: 123,
            payload: encode_frame(header, samples),
        }
    }

    #[test]
    fn applies_cell_calibration_from_stop_cell() {
        let decoder = Decoder::new(config(), table()).unwrap();
        let samples = [10, 10, 10, 10, 20, 20, 20, 20];
        let record = decoder.decode(&frame(0b101, 6, &samples)).unwrap();

        assert_eq!(record.channels, vec![0, 2]);
        assert_eq!(record.event_id, 5);
        assert_eq!(record.trigger_counter, 77);
        // cells visited: 6, 7, 0, 1
        assert_eq!(
            record.amplitude_mv.row(0).to_vec(),
            vec![2.0, 1.5, 5.0, 4.5]
        );
        assert_eq!(
            record.amplitude_mv.row(1).to_vec(),
            vec![7.0, 6.5, 10.0, 9.5]
        );
        // widths of cells 6, 7, 0 are 7, 8, 1
        assert_eq!(record.time_ns.row(0).to_vec(), vec![0.0, 7.0, 15.0, 16.0]);
    }

    #[test]
    fn time_axis_is_strictly_increasing() {
        let decoder = Decoder::new(config(), table()).unwrap();
        for stop in 0..CELLS as u16 {
            let record = decoder.decode(&frame(0b101, stop, &[0; 8])).unwrap();
            for row in record.time_ns.rows() {
                assert!(row.windows(2).into_iter().all(|w| w[1] > w[0]));
            }
        }
    }

    #[test]
    fn same_frame_decodes_identically() {
        let decoder = Decoder::new(config(), table()).unwrap();
        let raw = frame(0b101, 3, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let a = decoder.decode(&raw).unwrap();
        let b = decoder.decode(&raw).unwrap();
        assert_eq!(a, b);
        let bits = |r: &WaveformRecord| {
            r.amplitude_mv
                .iter()
                .chain(r.time_ns.iter())
                .map(|v| v.to_bits())
                .collect::<Vec<_>>()
        };
        assert_eq!(bits(&a), bits(&b));
    }

    #[test]
    fn rejects_mask_mismatch() {
        let decoder = Decoder::new(config(), table()).unwrap();
        let err = decoder.decode(&frame(0b001, 0, &[0; 4])).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Malformed {
                sequence: 5,
                reason: Malformed::ChannelMask {
                    expected: 0b101,
                    found: 0b001
                }
            }
        );
    }

    #[test]
    fn rejects_truncated_payload() {
        let decoder = Decoder::new(config(), table()).unwrap();
        let mut raw = frame(0b101, 0, &[0; 8]);
        raw.payload.truncate(raw.payload.len() - 2);
        let err = decoder.decode(&raw).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Malformed {
                reason: Malformed::PayloadLength {
                    declared: 16,
                    expected: 16,
                    actual: 14
                },
                ..
            }
        ));
    }

    #[test]
    fn rejects_stop_cell_outside_ring() {
        let decoder = Decoder::new(config(), table()).unwrap();
        let err = decoder.decode(&frame(0b101, CELLS as u16, &[0; 8])).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Malformed {
                reason: Malformed::StopCell { .. },
                ..
            }
        ));
    }

    #[test]
    fn table_must_cover_configuration() {
        let mut cfg = config();
        cfg.channel_mask = ChannelMask(0b11);
        assert!(matches!(
            Decoder::new(cfg, table()),
            Err(CalibrationError::MissingChannel(1))
        ));

        let mut cfg = config();
        cfg.sample_depth = CELLS + 1;
        assert!(matches!(
            Decoder::new(cfg, table()),
            Err(CalibrationError::TooFewCells { .. })
        ));
    }
}
