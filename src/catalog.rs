//! Variable catalog: short name to physical metadata.
//!
//! The built-in table covers the ERA5 fields handled by the pipeline. A JSON
//! file in the `ERA5_variables.json` shape can extend or override it; each
//! entry is either the 8-element record
//! `[long_name, unit, param, family, analysis, derived, cmip_name, cmip_unit]`
//! or a full descriptor object.

use crate::error::{ProcessorError, Result};
use crate::models::{Frequency, Product, Reducer, SourceFamily, VariableDescriptor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct VariableCatalog {
    entries: HashMap<String, VariableDescriptor>,
}

/// Compact constructor for the built-in table
#[allow(clippy::too_many_arguments)]
fn entry(
    short_name: &str,
    long_name: &str,
    source_param_id: u32,
    native_unit: &str,
    product: Product,
    cmip_name: &str,
    cmip_unit: &str,
    family: SourceFamily,
    frequency: Frequency,
) -> VariableDescriptor {
    VariableDescriptor {
        short_name: short_name.to_string(),
        long_name: long_name.to_string(),
        source_param_id,
        native_unit: native_unit.to_string(),
        product,
        cmip_name: cmip_name.to_string(),
        cmip_unit: cmip_unit.to_string(),
        family,
        frequency,
        derived: false,
        inputs: vec![short_name.to_string()],
        reducer: Reducer::Mean,
    }
}

impl VariableCatalog {
    /// Catalog holding the built-in ERA5 table
    pub fn builtin() -> Self {
        use Frequency::{Daily, Hourly};
        use Product::{Analysis, Forecast};
        use SourceFamily::{PressureLevel, Surface};

        let mut tasmax = entry("tasmax", "Daily Maximum Near-Surface Air Temperature", 167, "K", Analysis, "tasmax", "K", Surface, Hourly);
        tasmax.inputs = vec!["t2m".to_string()];
        tasmax.reducer = Reducer::Max;

        let mut tasmin = entry("tasmin", "Daily Minimum Near-Surface Air Temperature", 167, "K", Analysis, "tasmin", "K", Surface, Hourly);
        tasmin.inputs = vec!["t2m".to_string()];
        tasmin.reducer = Reducer::Min;

        let mut sfc_wind = entry("sfcWind", "Near-Surface Wind Speed", 207, "m s-1", Analysis, "sfcWind", "m s-1", Surface, Hourly);
        sfc_wind.derived = true;
        sfc_wind.inputs = vec!["u10".to_string(), "v10".to_string()];

        let z = entry("z", "Geopotential", 129, "m2 s-2", Analysis, "zg", "m", PressureLevel, Hourly);

        let entries = vec![
            entry("t2m", "2 metre temperature", 167, "K", Analysis, "tas", "K", Surface, Daily),
            entry("tp", "Total precipitation", 228, "kg m-2", Forecast, "pr", "kg m-2 s-1", Surface, Daily),
            entry("tcc", "Total cloud cover", 164, "(0 - 1)", Analysis, "clt", "%", Surface, Daily),
            entry("ssrd", "Surface solar radiation downwards", 169, "J m-2", Forecast, "rsds", "W m-2", Surface, Daily),
            entry("strd", "Surface thermal radiation downwards", 175, "J m-2", Forecast, "rlds", "W m-2", Surface, Daily),
            entry("str", "Surface net thermal radiation", 177, "J m-2", Forecast, "rls", "W m-2", Surface, Daily),
            entry("msl", "Mean sea level pressure", 151, "Pa", Analysis, "psl", "Pa", Surface, Daily),
            entry("u10", "10 metre U wind component", 165, "m s-1", Analysis, "uas", "m s-1", Surface, Daily),
            entry("v10", "10 metre V wind component", 166, "m s-1", Analysis, "vas", "m s-1", Surface, Daily),
            tasmax,
            tasmin,
            sfc_wind,
            entry("q", "Specific humidity", 133, "kg kg-1", Analysis, "hus", "1", PressureLevel, Daily),
            entry("r", "Relative humidity", 157, "%", Analysis, "hur", "%", PressureLevel, Daily),
            entry("t", "Temperature", 130, "K", Analysis, "ta", "K", PressureLevel, Daily),
            entry("u", "U component of wind", 131, "m s-1", Analysis, "ua", "m s-1", PressureLevel, Daily),
            entry("v", "V component of wind", 132, "m s-1", Analysis, "va", "m s-1", PressureLevel, Daily),
            entry("cc", "Fraction of cloud cover", 248, "(0 - 1)", Analysis, "cl", "%", PressureLevel, Daily),
            z,
        ];

        Self {
            entries: entries
                .into_iter()
                .map(|d| (d.short_name.clone(), d))
                .collect(),
        }
    }

    /// Load entries from a JSON file; fails with `CatalogLoad` on any malformed entry
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProcessorError::CatalogLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&content).map_err(|reason| ProcessorError::CatalogLoad {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_json_str(content: &str) -> std::result::Result<Self, String> {
        let raw: HashMap<String, CatalogRecord> =
            serde_json::from_str(content).map_err(|e| e.to_string())?;

        let mut entries = HashMap::new();
        for (short_name, record) in raw {
            let descriptor = record.into_descriptor(&short_name)?;
            entries.insert(short_name, descriptor);
        }
        debug!("Loaded {} catalog entries from JSON", entries.len());
        Ok(Self { entries })
    }

    /// Add or replace entries from `other`
    pub fn extend(&mut self, other: VariableCatalog) {
        self.entries.extend(other.entries);
    }

    pub fn lookup(&self, short_name: &str) -> Result<&VariableDescriptor> {
        self.entries
            .get(short_name)
            .ok_or_else(|| ProcessorError::UnknownVariable {
                short_name: short_name.to_string(),
            })
    }

    /// Descriptors of the raw fields `variable` is built from
    pub fn inputs_of(&self, variable: &VariableDescriptor) -> Result<Vec<VariableDescriptor>> {
        variable
            .inputs
            .iter()
            .map(|name| {
                if name == &variable.short_name {
                    Ok(variable.clone())
                } else {
                    self.lookup(name).cloned()
                }
            })
            .collect()
    }

    /// Sorted short names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogRecord {
    Full(Box<VariableDescriptor>),
    Compact(Vec<Value>),
}

impl CatalogRecord {
    fn into_descriptor(self, short_name: &str) -> std::result::Result<VariableDescriptor, String> {
        match self {
            CatalogRecord::Full(descriptor) => Ok(*descriptor),
            CatalogRecord::Compact(fields) => compact_descriptor(short_name, &fields),
        }
    }
}

fn compact_descriptor(short_name: &str, fields: &[Value]) -> std::result::Result<VariableDescriptor, String> {
    if fields.len() < 8 {
        return Err(format!(
            "entry '{short_name}' has {} fields, expected 8",
            fields.len()
        ));
    }

    let text = |i: usize| -> std::result::Result<String, String> {
        match &fields[i] {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(format!("entry '{short_name}' field {i}: unexpected {other}")),
        }
    };
    let flag = |i: usize| -> std::result::Result<bool, String> {
        match &fields[i] {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_i64() == Some(1)),
            Value::String(s) => Ok(matches!(s.trim(), "1" | "true" | "True")),
            other => Err(format!("entry '{short_name}' field {i}: unexpected {other}")),
        }
    };

    let source_param_id = text(2)?
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("entry '{short_name}' param id: {e}"))?;

    let family = match text(3)?.trim() {
        "pl" | "pressure_level" | "plev" => SourceFamily::PressureLevel,
        _ => SourceFamily::Surface,
    };

    let product = if flag(4)? {
        Product::Analysis
    } else {
        Product::Forecast
    };

    Ok(VariableDescriptor {
        short_name: short_name.to_string(),
        long_name: text(0)?,
        native_unit: text(1)?,
        source_param_id,
        family,
        product,
        derived: flag(5)?,
        cmip_name: text(6)?,
        cmip_unit: text(7)?,
        frequency: Frequency::Daily,
        inputs: vec![short_name.to_string()],
        reducer: Reducer::Mean,
    })
}
