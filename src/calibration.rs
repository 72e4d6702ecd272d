use crate::{backend::PhysicalLength, enums::LengthUnit};

use serde::Deserialize;

/// Converts raw stage coordinates into pixel coordinates.
///
/// Stage readings are expressed in `stage_unit`; the pixel size carries its
/// own unit, so the conversion factor is derived rather than assumed. For
/// metre stage readings and micrometre pixels this is `raw * 1e6 / size`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub stage_unit: LengthUnit,
}

impl Calibration {
    pub fn new(stage_unit: LengthUnit) -> Self {
        Self { stage_unit }
    }

    /// Calibrate one axis. Missing or zero pixel size, or an axis absent
    /// from the dimension order, yields `0.0`.
    pub fn calibrate(
        &self,
        raw_position: f64,
        pixel_size: Option<PhysicalLength>,
        axis_present: bool,
    ) -> f64 {
        match pixel_size {
            Some(size) if axis_present && size.value != 0.0 => {
                raw_position * self.stage_unit.factor_to(size.unit) / size.value
            }
            _ => 0.0,
        }
    }

    /// Calibrate both axes of a stage position against a dimension order
    /// string such as `"XYCZT"`.
    pub fn calibrate_xy(
        &self,
        raw: (f64, f64),
        size_x: Option<PhysicalLength>,
        size_y: Option<PhysicalLength>,
        dimension_order: &str,
    ) -> (f64, f64) {
        let order = dimension_order.to_ascii_uppercase();
        (
            self.calibrate(raw.0, size_x, order.contains('X')),
            self.calibrate(raw.1, size_y, order.contains('Y')),
        )
    }
}
