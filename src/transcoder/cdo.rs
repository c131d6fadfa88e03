//! Transcoder backed by the CDO and NCO command-line tools.
//!
//! Artifacts are NetCDF files. Every transformation is one or more tool
//! invocations issued through the [`CommandRunner`].

use super::{ChunkSpec, FieldShape, TargetGrid, TimeBucket, Transcoder};
use crate::command::{CommandRunner, ToolCommand};
use crate::constants::{AXIS_ALIASES, LAT_AXIS, LEVEL_AXIS, LON_AXIS, TIME_AXIS};
use crate::conversion::{DerivedField, DerivedKind, UnitConversion};
use crate::error::{ProcessorError, Result};
use crate::models::{Reducer, VariableDescriptor};
use async_trait::async_trait;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const GRIB_EXTENSIONS: &[&str] = &["grb", "grib", "grb2", "grib2"];

pub struct CdoTranscoder {
    runner: Arc<dyn CommandRunner>,
}

impl CdoTranscoder {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, stage: &str, command: ToolCommand) -> Result<String> {
        Ok(self.runner.run(stage, &command).await?.stdout)
    }

    fn cdo_f64() -> ToolCommand {
        ToolCommand::new("cdo").args(["-b", "F64"])
    }

    fn set_units(field: &str, units: &str, path: &Path) -> ToolCommand {
        ToolCommand::new("ncatted")
            .arg("-O")
            .arg("-a")
            .arg(format!("units,{field},o,c,{units}"))
            .path(path)
    }

    /// Rename alternative axis names; the leading `.` makes each rename optional
    fn canonical_axes(path: &Path) -> ToolCommand {
        let mut command = ToolCommand::new("ncrename").arg("-O");
        for (alias, canonical) in AXIS_ALIASES {
            command = command.arg("-d").arg(format!(".{alias},{canonical}"));
        }
        for (alias, canonical) in AXIS_ALIASES {
            command = command.arg("-v").arg(format!(".{alias},{canonical}"));
        }
        command.path(path)
    }

    async fn count(&self, operator: &str, input: &Path) -> Result<usize> {
        let stdout = self
            .run("inspect", ToolCommand::new("cdo").args(["-s", operator]).path(input))
            .await?;
        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| line.parse::<usize>().ok())
            .ok_or_else(|| {
                ProcessorError::stage("inspect", format!("unexpected `cdo {operator}` output: {stdout:?}"))
            })
    }
}

fn sibling(output: &Path, tag: &str) -> PathBuf {
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "nc".to_string());
    output.with_extension(format!("{tag}.{ext}"))
}

async fn remove_scratch(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn griddes_size(griddes: &str, key: &str) -> Result<usize> {
    let pattern = Regex::new(&format!(r"(?m)^\s*{key}\s*=\s*(\d+)"))
        .map_err(|e| ProcessorError::stage("inspect", e.to_string()))?;
    pattern
        .captures(griddes)
        .and_then(|c| c[1].parse::<usize>().ok())
        .ok_or_else(|| ProcessorError::stage("inspect", format!("grid description lacks {key}")))
}

#[async_trait]
impl Transcoder for CdoTranscoder {
    fn name(&self) -> &'static str {
        "cdo"
    }

    fn extension(&self) -> &'static str {
        "nc"
    }

    async fn normalize_format(&self, raw: &Path, _input: &VariableDescriptor, output: &Path) -> Result<()> {
        let is_grib = raw
            .extension()
            .map(|e| GRIB_EXTENSIONS.contains(&e.to_string_lossy().as_ref()))
            .unwrap_or(false);

        if is_grib {
            let regular = output.with_extension("regular.grb");
            self.run(
                "normalize-format",
                ToolCommand::new("cdo")
                    .args(["-t", "ecmwf", "-setgridtype,regular"])
                    .path(raw)
                    .path(&regular),
            )
            .await?;
            self.run(
                "normalize-format",
                ToolCommand::new("grib_to_netcdf").arg("-o").path(output).path(&regular),
            )
            .await?;
            remove_scratch(&regular).await?;
        } else {
            self.run("normalize-format", ToolCommand::new("cdo").arg("copy").path(raw).path(output))
                .await?;
        }

        self.run("normalize-format", Self::canonical_axes(output)).await?;
        Ok(())
    }

    async fn apply_unit_conversion(
        &self,
        input: &Path,
        field: &str,
        conversion: &UnitConversion,
        cmip_unit: &str,
        output: &Path,
    ) -> Result<()> {
        let (operator, relabel) = match conversion {
            UnitConversion::Identity => (None, false),
            UnitConversion::Multiply { factor } => (Some(format!("mulc,{factor}")), true),
            UnitConversion::Divide { divisor } => (Some(format!("divc,{divisor}")), true),
            UnitConversion::Relabel => (None, true),
            UnitConversion::Derived(_) => {
                return Err(ProcessorError::stage(
                    "unit-convert",
                    "derived fields are computed by derive_field",
                ));
            }
        };

        let command = match operator {
            Some(operator) => Self::cdo_f64().arg(operator),
            None => ToolCommand::new("cdo").arg("copy"),
        };
        self.run("unit-convert", command.path(input).path(output)).await?;

        if relabel {
            self.run("unit-convert", Self::set_units(field, cmip_unit, output))
                .await?;
        }
        Ok(())
    }

    async fn derive_field(
        &self,
        inputs: &[(PathBuf, String)],
        recipe: &DerivedField,
        field: &str,
        output: &Path,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(ProcessorError::stage("derive", "no input fields"));
        }

        let merged = sibling(output, "merged");
        let mut merge = Self::cdo_f64().arg("merge");
        for (path, _) in inputs {
            merge = merge.path(path);
        }
        self.run("derive", merge.path(&merged)).await?;

        let expression = match recipe.method {
            DerivedKind::Magnitude => {
                let squares: Vec<String> = inputs.iter().map(|(_, name)| format!("sqr({name})")).collect();
                format!("{field}=sqrt({})", squares.join("+"))
            }
        };
        self.run(
            "derive",
            Self::cdo_f64().arg(format!("expr,{expression}")).path(&merged).path(output),
        )
        .await?;

        self.run(
            "derive",
            ToolCommand::new("ncatted")
                .arg("-O")
                .args([
                    "-a".to_string(),
                    format!("standard_name,{field},o,c,{}", recipe.standard_name),
                    "-a".to_string(),
                    format!("long_name,{field},o,c,{}", recipe.long_name),
                    "-a".to_string(),
                    format!("units,{field},o,c,{}", recipe.units),
                    "-a".to_string(),
                    format!("_FillValue,{field},o,d,{:e}", recipe.fill_value),
                ])
                .path(output),
        )
        .await?;

        remove_scratch(&merged).await
    }

    async fn reduce_time(
        &self,
        inputs: &[PathBuf],
        _field: &str,
        reducer: Reducer,
        bucket: TimeBucket,
        output: &Path,
    ) -> Result<()> {
        let operator = match bucket {
            TimeBucket::Day => format!("day{reducer}"),
            TimeBucket::Month => format!("mon{reducer}"),
        };

        let mut command = Self::cdo_f64().arg(operator);
        match inputs {
            [] => return Err(ProcessorError::stage("aggregate", "no inputs to reduce")),
            [single] => command = command.path(single),
            many => {
                command = command.arg("-mergetime");
                for path in many {
                    command = command.path(path);
                }
            }
        }
        self.run("aggregate", command.path(output)).await?;
        Ok(())
    }

    async fn regrid_and_chunk(
        &self,
        input: &Path,
        grid: Option<&TargetGrid>,
        chunks: &ChunkSpec,
        output: &Path,
    ) -> Result<()> {
        let mut scratch = Vec::new();

        let source = match grid {
            Some(grid) => {
                let grid_file = match grid {
                    TargetGrid::File { path } => path.clone(),
                    TargetGrid::Regular { .. } => {
                        let path = output.with_extension("griddes.txt");
                        tokio::fs::write(&path, grid.griddes().unwrap_or_default()).await?;
                        scratch.push(path.clone());
                        path
                    }
                };
                let regridded = sibling(output, "regrid");
                self.run(
                    "regrid-and-chunk",
                    Self::cdo_f64()
                        .arg(format!("remapcon,{}", grid_file.display()))
                        .path(input)
                        .path(&regridded),
                )
                .await?;
                scratch.push(regridded.clone());
                regridded
            }
            None => input.to_path_buf(),
        };

        let mut command = ToolCommand::new("ncks")
            .args(["-O", "-4", "-D", "4", "--cnk_plc=g3d"])
            .arg(format!("--cnk_dmn={TIME_AXIS},{}", chunks.time));
        if let Some(level) = chunks.level {
            command = command.arg(format!("--cnk_dmn={LEVEL_AXIS},{level}"));
        }
        command = command
            .arg(format!("--cnk_dmn={LAT_AXIS},{}", chunks.lat))
            .arg(format!("--cnk_dmn={LON_AXIS},{}", chunks.lon))
            .args(["-L", "1"])
            .path(&source)
            .path(output);
        self.run("regrid-and-chunk", command).await?;

        for path in scratch {
            remove_scratch(&path).await?;
        }
        Ok(())
    }

    async fn rename(&self, input: &Path, from: &str, to: &str, output: &Path) -> Result<()> {
        let command = if from == to {
            ToolCommand::new("cdo").arg("copy").path(input).path(output)
        } else {
            ToolCommand::new("ncrename")
                .arg("-O")
                .arg("-v")
                .arg(format!("{from},{to}"))
                .path(input)
                .path(output)
        };
        self.run("rename", command).await?;
        Ok(())
    }

    async fn inspect(&self, input: &Path) -> Result<FieldShape> {
        let times = self.count("ntime", input).await?;
        let levels = self.count("nlevel", input).await?;
        let griddes = self
            .run("inspect", ToolCommand::new("cdo").args(["-s", "griddes"]).path(input))
            .await?;

        Ok(FieldShape {
            times,
            levels: (levels > 1).then_some(levels),
            lats: griddes_size(&griddes, "ysize")?,
            lons: griddes_size(&griddes, "xsize")?,
        })
    }
}
