//! Flat Lambda-CDM distance measures
//!
//! Comoving distance is integrated once onto a fine redshift table and then
//! linearly interpolated, so per-source distance lookups stay cheap for
//! populations of millions of sources. All distances are in Mpc.

use crate::{FiresongError, Result};

/// Speed of light [km/s]
pub const SPEED_OF_LIGHT_KMS: f64 = 299_792.458;
/// Megaparsec in centimetres
pub const MPC_TO_CM: f64 = 3.0857e24;

const TABLE_STEP: f64 = 1e-3;
const DEFAULT_TABLE_ZMAX: f64 = 12.0;

/// Flat universe with matter and a cosmological constant.
#[derive(Debug, Clone, PartialEq)]
pub struct Cosmology {
    pub omega_m: f64,
    pub omega_lambda: f64,
    /// Dimensionless Hubble parameter, H0 = 100 h km/s/Mpc
    pub h: f64,
    /// Cumulative comoving distance at `i * TABLE_STEP`
    comoving_table: Vec<f64>,
}

impl Cosmology {
    /// Planck 2015 parameters.
    pub fn planck2015() -> Self {
        Self::tabulated(0.308, 0.678, DEFAULT_TABLE_ZMAX)
    }

    /// Flat cosmology (omega_lambda = 1 - omega_m) tabulated up to `table_zmax`.
    pub fn flat(omega_m: f64, h: f64, table_zmax: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&omega_m) || h <= 0.0 || table_zmax <= 0.0 {
            return Err(FiresongError::InvalidConfig(format!(
                "invalid cosmology: omega_m={omega_m}, h={h}, table_zmax={table_zmax}"
            )));
        }

        Ok(Self::tabulated(omega_m, h, table_zmax))
    }

    fn tabulated(omega_m: f64, h: f64, table_zmax: f64) -> Self {
        let mut cosmology = Self {
            omega_m,
            omega_lambda: 1.0 - omega_m,
            h,
            comoving_table: Vec::new(),
        };
        cosmology.comoving_table = cosmology.integrate_comoving_table(table_zmax);
        cosmology
    }

    /// Hubble distance c / H0 [Mpc]
    pub fn hubble_distance(&self) -> f64 {
        SPEED_OF_LIGHT_KMS / (100.0 * self.h)
    }

    /// E(z) = H(z) / H0
    pub fn efunc(&self, z: f64) -> f64 {
        (self.omega_m * (1.0 + z).powi(3) + self.omega_lambda).sqrt()
    }

    fn table_zmax(&self) -> f64 {
        (self.comoving_table.len() - 1) as f64 * TABLE_STEP
    }

    /// Line-of-sight comoving distance [Mpc]
    pub fn comoving_distance(&self, z: f64) -> f64 {
        if z <= 0.0 {
            return 0.0;
        }
        let last = self.comoving_table.len() - 1;
        let pos = z / TABLE_STEP;
        let i = (pos.floor() as usize).min(last - 1);
        let t = pos - i as f64;
        let base = self.comoving_table[i];
        let next = self.comoving_table[i + 1];
        if i + 1 < last || t <= 1.0 {
            base + t * (next - base)
        } else {
            // beyond the table: integrate the remainder directly
            next + self.integrate_segment(self.table_zmax(), z)
        }
    }

    /// Luminosity distance (1 + z) D_C [Mpc]
    pub fn luminosity_distance(&self, z: f64) -> f64 {
        (1.0 + z) * self.comoving_distance(z)
    }

    /// Differential comoving volume per unit redshift per steradian [Mpc^3/sr]
    pub fn diff_comoving_volume(&self, z: f64) -> f64 {
        let dc = self.comoving_distance(z);
        self.hubble_distance() * dc * dc / self.efunc(z)
    }

    fn integrate_comoving_table(&self, zmax: f64) -> Vec<f64> {
        let n = (zmax / TABLE_STEP).ceil() as usize;
        let dh = self.hubble_distance();
        let mut table = Vec::with_capacity(n + 1);
        table.push(0.0);
        let mut acc = 0.0;
        let mut prev = 1.0 / self.efunc(0.0);
        for i in 1..=n {
            let next = 1.0 / self.efunc(i as f64 * TABLE_STEP);
            acc += 0.5 * TABLE_STEP * dh * (prev + next);
            table.push(acc);
            prev = next;
        }
        table
    }

    fn integrate_segment(&self, z0: f64, z1: f64) -> f64 {
        let steps = (((z1 - z0) / TABLE_STEP).ceil() as usize).max(1);
        let dz = (z1 - z0) / steps as f64;
        let dh = self.hubble_distance();
        (0..steps)
            .map(|k| {
                let a = z0 + k as f64 * dz;
                0.5 * dz * dh * (1.0 / self.efunc(a) + 1.0 / self.efunc(a + dz))
            })
            .sum()
    }
}

impl Default for Cosmology {
    fn default() -> Self {
        Self::planck2015()
    }
}
