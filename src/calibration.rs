use crate::{CalibrationError, N_CELLS};
use hdf5::{types::VarLenUnicode, File};
use ndarray::{Array1, Array2, Axis};
use std::{collections::BTreeMap, path::Path, str::FromStr};

/// Nominal DRS4 cell width at 5.12 GS/s.
pub const NOMINAL_BIN_WIDTH_NS: f32 = 0.195_312_5;
/// 1 V input range over 12 bits.
pub const NOMINAL_GAIN_MV: f32 = 1000.0 / 4096.0;

/// Per-cell corrections for one channel, indexed by physical cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCalibration {
    /// ADC counts subtracted from the raw sample.
    pub offsets: Vec<f32>,
    /// mV per ADC count.
    pub gains: Vec<f32>,
    /// Width of each cell in ns.
    pub bin_widths: Vec<f32>,
}

/// Amplitude and timing calibration of one board, loaded once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    id: String,
    version: u32,
    n_cells: usize,
    channels: BTreeMap<u8, ChannelCalibration>,
}

impl CalibrationTable {
    /// Validates every channel and builds the table.
    pub fn new(
        id: impl Into<String>,
        version: u32,
        n_cells: usize,
        channels: BTreeMap<u8, ChannelCalibration>,
    ) -> Result<Self, CalibrationError> {
        for (&channel, cal) in &channels {
            for (name, len) in [
                ("offsets", cal.offsets.len()),
                ("gains", cal.gains.len()),
                ("bin_widths", cal.bin_widths.len()),
            ] {
                if len != n_cells {
                    return Err(CalibrationError::CellCount {
                        channel,
                        name,
                        expected: n_cells,
                        found: len,
                    });
                }
            }
            if let Some((cell, &width)) = cal
                .bin_widths
                .iter()
                .enumerate()
                .find(|(_, w)| !(w.is_finite() && **w > 0.0))
            {
                return Err(CalibrationError::BinWidth {
                    channel,
                    cell,
                    width,
                });
            }
        }

        Ok(Self {
            id: id.into(),
            version,
            n_cells,
            channels,
        })
    }

    /// A table with zero offsets, nominal gain and equal cell widths.
    pub fn ideal(channels: &[u8]) -> Self {
        let channels = channels
            .iter()
            .map(|&ch| {
                (
                    ch,
                    ChannelCalibration {
                        offsets: vec![0.0; N_CELLS],
                        gains: vec![NOMINAL_GAIN_MV; N_CELLS],
                        bin_widths: vec![NOMINAL_BIN_WIDTH_NS; N_CELLS],
                    },
                )
            })
            .collect();
        Self {
            id: "ideal".to_string(),
            version: 0,
            n_cells: N_CELLS,
            channels,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelCalibration> {
        self.channels.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels.keys().copied()
    }

    /// Read a table written by [`CalibrationTable::save`].
    ///
    /// Layout: root attributes `id` and `version`, dataset `channel` (n),
    /// and datasets `offset`, `gain`, `bin_width` of shape (n, cells).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let file = File::open(path)?;
        let id: VarLenUnicode = file.attr("id")?.read_scalar()?;
        let version: u32 = file.attr("version")?.read_scalar()?;

        let channel_ids = file.dataset("channel")?.read_1d::<u8>()?;
        let offsets = file.dataset("offset")?.read_2d::<f32>()?;
        let gains = file.dataset("gain")?.read_2d::<f32>()?;
        let widths = file.dataset("bin_width")?.read_2d::<f32>()?;

        let n_cells = offsets.ncols();
        for (name, array) in [("gain", &gains), ("bin_width", &widths), ("offset", &offsets)] {
            if array.dim() != (channel_ids.len(), n_cells) {
                return Err(CalibrationError::Attribute(
                    "shape",
                    format!(
                        "{name} is {:?}, expected ({}, {n_cells})",
                        array.dim(),
                        channel_ids.len()
                    ),
                ));
            }
        }

        let channels = channel_ids
            .iter()
            .enumerate()
            .map(|(row, &ch)| {
                (
                    ch,
                    ChannelCalibration {
                        offsets: offsets.row(row).to_vec(),
                        gains: gains.row(row).to_vec(),
                        bin_widths: widths.row(row).to_vec(),
                    },
                )
            })
            .collect();

        Self::new(id.as_str(), version, n_cells, channels)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let file = File::create(path)?;
        let id = VarLenUnicode::from_str(&self.id)
            .map_err(|e| CalibrationError::Attribute("id", e.to_string()))?;
        file.new_attr::<VarLenUnicode>()
            .create("id")?
            .write_scalar(&id)?;
        file.new_attr::<u32>()
            .create("version")?
            .write_scalar(&self.version)?;

        let ids: Array1<u8> = self.channels.keys().copied().collect();
        let n = ids.len();
        let mut offsets = Array2::<f32>::zeros((n, self.n_cells));
        let mut gains = Array2::<f32>::zeros((n, self.n_cells));
        let mut widths = Array2::<f32>::zeros((n, self.n_cells));
        for (row, cal) in self.channels.values().enumerate() {
            offsets
                .index_axis_mut(Axis(0), row)
                .assign(&Array1::from(cal.offsets.clone()));
            gains
                .index_axis_mut(Axis(0), row)
                .assign(&Array1::from(cal.gains.clone()));
            widths
                .index_axis_mut(Axis(0), row)
                .assign(&Array1::from(cal.bin_widths.clone()));
        }

        file.new_dataset_builder().with_data(&ids).create("channel")?;
        file.new_dataset_builder().with_data(&offsets).create("offset")?;
        file.new_dataset_builder().with_data(&gains).create("gain")?;
        file.new_dataset_builder().with_data(&widths).create("bin_width")?;
        Ok(())
    }
}
