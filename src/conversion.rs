//! Unit-conversion table and per-variable conversion plans.
//!
//! Every variable whose native unit differs from its CMIP unit must have a
//! registered branch here. The set of branch kinds is closed; new variables
//! are added as data, either in the built-in table or through the
//! `conversions` section of the configuration file.

use crate::catalog::VariableCatalog;
use crate::constants::{DERIVED_FILL_VALUE, PERCENT, SECONDS_PER_DAY, STANDARD_GRAVITY};
use crate::error::{ProcessorError, Result};
use crate::models::{Reducer, VariableDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How a derived field is computed from its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedKind {
    /// Euclidean norm of the input components
    Magnitude,
}

/// Recipe and fresh metadata of a derived field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub inputs: Vec<String>,
    pub method: DerivedKind,
    pub standard_name: String,
    pub long_name: String,
    pub units: String,
    #[serde(default = "default_fill_value")]
    pub fill_value: f64,
}

fn default_fill_value() -> f64 {
    DERIVED_FILL_VALUE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitConversion {
    Identity,
    Multiply { factor: f64 },
    Divide { divisor: f64 },
    /// Only the unit attribute is rewritten
    Relabel,
    Derived(DerivedField),
}

impl UnitConversion {
    /// Scale factor applied to the values, if any
    pub fn scale_factor(&self) -> Option<f64> {
        match self {
            UnitConversion::Multiply { factor } => Some(*factor),
            UnitConversion::Divide { divisor } => Some(1.0 / *divisor),
            _ => None,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, UnitConversion::Identity)
    }
}

impl fmt::Display for UnitConversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitConversion::Identity => write!(f, "identity"),
            UnitConversion::Multiply { factor } => write!(f, "multiply({factor})"),
            UnitConversion::Divide { divisor } => write!(f, "divide({divisor})"),
            UnitConversion::Relabel => write!(f, "relabel"),
            UnitConversion::Derived(derived) => {
                write!(f, "derived({})", derived.inputs.join(", "))
            }
        }
    }
}

/// Registry of unit-conversion branches keyed by variable short name
#[derive(Debug, Clone, Default)]
pub struct ConversionTable {
    entries: HashMap<String, UnitConversion>,
}

impl ConversionTable {
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();

        for name in ["tcc", "cc"] {
            entries.insert(name.to_string(), UnitConversion::Multiply { factor: PERCENT });
        }
        for name in ["tp", "ssrd", "strd", "str"] {
            entries.insert(
                name.to_string(),
                UnitConversion::Divide {
                    divisor: SECONDS_PER_DAY,
                },
            );
        }
        entries.insert(
            "z".to_string(),
            UnitConversion::Divide {
                divisor: STANDARD_GRAVITY,
            },
        );
        entries.insert("q".to_string(), UnitConversion::Relabel);
        entries.insert(
            "sfcWind".to_string(),
            UnitConversion::Derived(DerivedField {
                inputs: vec!["u10".to_string(), "v10".to_string()],
                method: DerivedKind::Magnitude,
                standard_name: "wind_speed".to_string(),
                long_name: "Near-Surface Wind Speed".to_string(),
                units: "m s-1".to_string(),
                fill_value: DERIVED_FILL_VALUE,
            }),
        );

        Self { entries }
    }

    /// Add or replace branches
    pub fn extend(&mut self, extra: HashMap<String, UnitConversion>) {
        self.entries.extend(extra);
    }

    pub fn get(&self, short_name: &str) -> Option<&UnitConversion> {
        self.entries.get(short_name)
    }

    /// Select the conversion branch for `variable`
    pub fn resolve(&self, variable: &VariableDescriptor) -> Result<UnitConversion> {
        let registered = self.entries.get(&variable.short_name);

        if variable.derived {
            return match registered {
                Some(UnitConversion::Derived(recipe)) => {
                    if recipe.inputs != variable.inputs {
                        return Err(ProcessorError::UnsupportedVariable {
                            short_name: variable.short_name.clone(),
                            reason: format!(
                                "recipe inputs {:?} do not match catalog inputs {:?}",
                                recipe.inputs, variable.inputs
                            ),
                        });
                    }
                    Ok(UnitConversion::Derived(recipe.clone()))
                }
                _ => Err(ProcessorError::UnsupportedVariable {
                    short_name: variable.short_name.clone(),
                    reason: "derived variable has no registered recipe".to_string(),
                }),
            };
        }

        match registered {
            Some(UnitConversion::Derived(_)) => Err(ProcessorError::UnsupportedVariable {
                short_name: variable.short_name.clone(),
                reason: "derived recipe registered for a plain variable".to_string(),
            }),
            Some(conversion) if !(conversion.is_identity() && variable.needs_unit_conversion()) => {
                Ok(conversion.clone())
            }
            _ if !variable.needs_unit_conversion() => Ok(UnitConversion::Identity),
            _ => Err(ProcessorError::UnsupportedUnitConversion {
                short_name: variable.short_name.clone(),
                native_unit: variable.native_unit.clone(),
                cmip_unit: variable.cmip_unit.clone(),
            }),
        }
    }
}

/// One named step of a conversion plan
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Fetch,
    NormalizeFormat,
    UnitConvert(UnitConversion),
    Aggregate(Reducer),
    RegridAndChunk,
    Rename,
    MonthlyMean,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::NormalizeFormat => "normalize-format",
            Stage::UnitConvert(_) => "unit-convert",
            Stage::Aggregate(_) => "aggregate",
            Stage::RegridAndChunk => "regrid-and-chunk",
            Stage::Rename => "rename",
            Stage::MonthlyMean => "monthly-mean",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::UnitConvert(conversion) => write!(f, "{}[{}]", self.name(), conversion),
            Stage::Aggregate(reducer) => write!(f, "{}[{}]", self.name(), reducer),
            _ => f.write_str(self.name()),
        }
    }
}

/// Ordered stage sequence for one variable
#[derive(Debug, Clone)]
pub struct ConversionPlan {
    pub variable: VariableDescriptor,
    /// Raw fields fetched for the variable, in recipe order
    pub inputs: Vec<VariableDescriptor>,
    pub conversion: UnitConversion,
    pub stages: Vec<Stage>,
}

impl ConversionPlan {
    /// Resolve the plan; fails before any side effect when no branch exists
    pub fn resolve(
        variable: &VariableDescriptor,
        catalog: &VariableCatalog,
        table: &ConversionTable,
    ) -> Result<Self> {
        let conversion = table.resolve(variable)?;
        let inputs = catalog.inputs_of(variable)?;

        let mut stages = vec![
            Stage::Fetch,
            Stage::NormalizeFormat,
            Stage::UnitConvert(conversion.clone()),
        ];
        if variable.frequency.is_sub_daily() {
            stages.push(Stage::Aggregate(variable.reducer));
        }
        stages.extend([Stage::RegridAndChunk, Stage::Rename, Stage::MonthlyMean]);

        Ok(Self {
            variable: variable.clone(),
            inputs,
            conversion,
            stages,
        })
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.conversion, UnitConversion::Derived(_))
    }

    /// Compact `stage -> stage` rendering for dry runs and logs
    pub fn describe(&self) -> String {
        self.stages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
