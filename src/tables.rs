//! Tabulated instrument and attenuation functions
//!
//! Loads whitespace-separated numeric tables once at startup and exposes
//! point and interpolated lookup. Lines starting with `#` and blank lines are
//! skipped. Every table is immutable after loading.

use std::fs;
use std::path::Path;

use ndarray::Array2;
use tracing::debug;

use crate::{FiresongError, Result};

/// Highest energy [TeV] at which the attenuation table is defined.
pub const EBL_MAX_ENERGY_TEV: f64 = 100.0;

/// Generic row-major numeric table.
#[derive(Debug, Clone, PartialEq)]
pub struct TabulatedFunction {
    rows: Vec<Vec<f64>>,
    n_cols: usize,
    source: String,
}

impl TabulatedFunction {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let table = Self::parse(&raw, &path.display().to_string())?;
        debug!(
            path = %path.display(),
            rows = table.len(),
            cols = table.n_cols,
            "loaded table"
        );
        Ok(table)
    }

    /// Parse table text. `source` only labels error messages.
    pub fn parse(raw: &str, source: &str) -> Result<Self> {
        let mut rows = Vec::new();
        let mut n_cols = 0;

        for (line_idx, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let row = trimmed
                .split_whitespace()
                .map(|field| {
                    field.parse::<f64>().map_err(|_| FiresongError::MalformedTable {
                        path: source.to_string(),
                        line: line_idx + 1,
                        reason: format!("not a number: {field}"),
                    })
                })
                .collect::<Result<Vec<f64>>>()?;

            if n_cols == 0 {
                n_cols = row.len();
            } else if row.len() != n_cols {
                return Err(FiresongError::MalformedTable {
                    path: source.to_string(),
                    line: line_idx + 1,
                    reason: format!("expected {n_cols} columns, found {}", row.len()),
                });
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(FiresongError::MalformedTable {
                path: source.to_string(),
                line: 0,
                reason: "table has no data rows".to_string(),
            });
        }

        Ok(Self {
            rows,
            n_cols,
            source: source.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn column(&self, idx: usize) -> Result<Vec<f64>> {
        self.require_columns(idx + 1)?;
        Ok(self.rows.iter().map(|row| row[idx]).collect())
    }

    pub fn require_columns(&self, min_cols: usize) -> Result<()> {
        if self.n_cols < min_cols {
            return Err(FiresongError::MalformedTable {
                path: self.source.clone(),
                line: 0,
                reason: format!("need at least {min_cols} columns, found {}", self.n_cols),
            });
        }
        Ok(())
    }

    /// Checks that the first column can serve as a lookup key.
    pub fn require_increasing_key(&self) -> Result<()> {
        for (idx, pair) in self.rows.windows(2).enumerate() {
            if pair[1][0] <= pair[0][0] {
                return Err(FiresongError::MalformedTable {
                    path: self.source.clone(),
                    line: idx + 2,
                    reason: "first column must be strictly increasing".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Linear interpolation of column `col` against the first column.
    pub fn interpolate(&self, x: f64, col: usize) -> Result<f64> {
        self.require_columns(col + 1)?;
        let xs: Vec<f64> = self.rows.iter().map(|row| row[0]).collect();
        let ys: Vec<f64> = self.rows.iter().map(|row| row[col]).collect();
        interp(x, &xs, &ys)
    }
}

/// Linear interpolation on a strictly increasing grid.
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64> {
    if xs.len() != ys.len() {
        return Err(FiresongError::LengthMismatch {
            context: "interpolation ys",
            expected: xs.len(),
            got: ys.len(),
        });
    }
    let (Some(&min_x), Some(&max_x)) = (xs.first(), xs.last()) else {
        return Err(FiresongError::InvalidConfig(
            "interpolation grid is empty".to_string(),
        ));
    };
    if !(min_x..=max_x).contains(&x) {
        return Err(FiresongError::OutOfDomain {
            value: x,
            min: min_x,
            max: max_x,
        });
    }

    let idx = xs.partition_point(|&v| v < x);
    if xs[idx] == x || idx == 0 {
        return Ok(ys[idx]);
    }

    let (x1, x2) = (xs[idx - 1], xs[idx]);
    let (y1, y2) = (ys[idx - 1], ys[idx]);
    let t = (x - x1) / (x2 - x1);
    Ok(y1 + t * (y2 - y1))
}

/// One row of the effective-area table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaBin {
    /// Bin centre [TeV]
    pub energy_tev: f64,
    /// Effective area [m^2]
    pub area_m2: f64,
}

/// Instrument effective area versus energy (`energy_TeV area_m2`).
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveArea {
    bins: Vec<AreaBin>,
}

impl EffectiveArea {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_table(&TabulatedFunction::load(path)?)
    }

    pub fn from_table(table: &TabulatedFunction) -> Result<Self> {
        table.require_columns(2)?;
        table.require_increasing_key()?;
        if table.rows().iter().any(|row| row[0] <= 0.0) {
            return Err(FiresongError::MalformedTable {
                path: table.source.clone(),
                line: 0,
                reason: "energies must be positive".to_string(),
            });
        }
        let bins = table
            .rows()
            .iter()
            .map(|row| AreaBin {
                energy_tev: row[0],
                area_m2: row[1],
            })
            .collect();
        Ok(Self { bins })
    }

    pub fn bins(&self) -> &[AreaBin] {
        &self.bins
    }

    /// Bins at or below the attenuation-table energy limit.
    pub fn bins_below(&self, max_energy_tev: f64) -> &[AreaBin] {
        let end = self.bins.partition_point(|b| b.energy_tev <= max_energy_tev);
        &self.bins[..end]
    }
}

/// Background rate table (`*, *, rate_Hz`).
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundRate {
    rates_hz: Vec<f64>,
}

impl BackgroundRate {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_table(&TabulatedFunction::load(path)?)
    }

    pub fn from_table(table: &TabulatedFunction) -> Result<Self> {
        Ok(Self {
            rates_hz: table.column(2)?,
        })
    }

    pub fn total_rate_hz(&self) -> f64 {
        self.rates_hz.iter().sum()
    }

    /// Expected background counts in an observation of `obs_time_hours`.
    pub fn counts(&self, obs_time_hours: f64) -> f64 {
        self.rates_hz
            .iter()
            .map(|rate| rate * 3600.0 * obs_time_hours)
            .sum()
    }
}

/// Optical depth of the extragalactic background light, tau(E, z).
///
/// File layout: the first data row holds a placeholder followed by the
/// redshift axis; each following row holds an energy [TeV] and one optical
/// depth per redshift.
#[derive(Debug, Clone, PartialEq)]
pub struct EblAttenuation {
    /// log10 of energies [TeV], increasing
    log_energies: Vec<f64>,
    /// Redshift axis, increasing
    redshifts: Vec<f64>,
    /// Optical depth indexed as [energy, redshift]
    tau: Array2<f64>,
}

impl EblAttenuation {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_table(&TabulatedFunction::load(path)?)
    }

    pub fn from_table(table: &TabulatedFunction) -> Result<Self> {
        table.require_columns(2)?;
        if table.len() < 2 {
            return Err(FiresongError::MalformedTable {
                path: table.source.clone(),
                line: 0,
                reason: "attenuation table needs a redshift header and data rows".to_string(),
            });
        }

        let redshifts = table.rows()[0][1..].to_vec();
        let body = &table.rows()[1..];
        let malformed = |reason: &str| FiresongError::MalformedTable {
            path: table.source.clone(),
            line: 0,
            reason: reason.to_string(),
        };

        if redshifts.windows(2).any(|w| w[1] <= w[0]) || redshifts[0] < 0.0 {
            return Err(malformed("redshift axis must be non-negative and increasing"));
        }
        if body.iter().any(|row| row[0] <= 0.0) {
            return Err(malformed("energies must be positive"));
        }
        let log_energies: Vec<f64> = body.iter().map(|row| row[0].log10()).collect();
        if log_energies.windows(2).any(|w| w[1] <= w[0]) {
            return Err(malformed("energies must be strictly increasing"));
        }

        let mut tau = Array2::zeros((body.len(), redshifts.len()));
        for (i, row) in body.iter().enumerate() {
            for (j, value) in row[1..].iter().enumerate() {
                tau[[i, j]] = *value;
            }
        }

        Ok(Self {
            log_energies,
            redshifts,
            tau,
        })
    }

    /// Bilinear interpolation in (log10 E, z).
    ///
    /// Energies outside the table are clamped to its edges. Below the first
    /// tabulated redshift the depth falls linearly to zero at z = 0; above
    /// the last one it is clamped.
    pub fn tau(&self, energy_tev: f64, redshift: f64) -> f64 {
        if redshift <= 0.0 {
            return 0.0;
        }
        let z0 = self.redshifts[0];
        if redshift < z0 {
            return self.tau(energy_tev, z0) * redshift / z0;
        }

        let (i0, i1, t) = bracket(&self.log_energies, energy_tev.log10());
        let (j0, j1, u) = bracket(&self.redshifts, redshift);

        let t00 = self.tau[[i0, j0]];
        let t01 = self.tau[[i0, j1]];
        let t10 = self.tau[[i1, j0]];
        let t11 = self.tau[[i1, j1]];

        (1.0 - t) * (1.0 - u) * t00 + (1.0 - t) * u * t01 + t * (1.0 - u) * t10 + t * u * t11
    }

    pub fn attenuation(&self, energy_tev: f64, redshift: f64) -> f64 {
        (-self.tau(energy_tev, redshift)).exp()
    }
}

/// Lower/upper indices and fractional position of `x` on `grid`, clamped.
fn bracket(grid: &[f64], x: f64) -> (usize, usize, f64) {
    let last = grid.len() - 1;
    if last == 0 || x <= grid[0] {
        return (0, 0, 0.0);
    }
    if x >= grid[last] {
        return (last, last, 0.0);
    }
    let hi = grid.partition_point(|&g| g <= x).min(last);
    let lo = hi - 1;
    let t = (x - grid[lo]) / (grid[hi] - grid[lo]);
    (lo, hi, t)
}
