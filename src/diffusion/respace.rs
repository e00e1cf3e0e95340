//! # Timestep Respacing
//!
//! Sampling with all `T` steps of a training schedule is slow. Respacing keeps
//! a subset of the original steps and re-derives betas over that subset so the
//! cumulative products, and hence the noise levels seen by the predictor, are
//! unchanged at every kept step.
use std::collections::BTreeSet;

use regex::Regex;
use tracing::info;

use super::schedule::NoiseSchedule;
use crate::error::{DiffusionError, Result};

const DDIM_PAT: &str = r"^ddim(\d+)$";

fn parse_count(s: &str) -> Result<usize> {
    let count: i64 = s
        .trim()
        .parse()
        .map_err(|_| DiffusionError::config(format!("invalid step count {s:?} in respacing")))?;
    if count <= 0 {
        return Err(DiffusionError::config(format!("step count must be positive, got {count}")));
    }
    Ok(count as usize)
}

/// Picks which steps of a `num_timesteps` long schedule to keep.
///
/// `section_counts` is either `"ddimN"` (a single integer stride yielding
/// exactly `N` steps), a single count (`"128"`), or comma separated counts, one
/// per equal-length segment of the original schedule (`"10,15,20"`). Within a
/// segment the kept steps are evenly spaced and include both segment ends.
pub fn space_timesteps(num_timesteps: usize, section_counts: &str) -> Result<BTreeSet<usize>> {
    let re = Regex::new(DDIM_PAT).map_err(|e| DiffusionError::config(e.to_string()))?;
    if let Some(caps) = re.captures(section_counts.trim()) {
        let desired_count = parse_count(&caps[1])?;
        for stride in 1..num_timesteps.max(2) {
            let steps: BTreeSet<usize> = (0..num_timesteps).step_by(stride).collect();
            if steps.len() == desired_count {
                return Ok(steps);
            }
        }
        return Err(DiffusionError::config(format!(
            "cannot create exactly {desired_count} steps with an integer stride over {num_timesteps}"
        )));
    }

    let counts = section_counts.split(',').map(parse_count).collect::<Result<Vec<_>>>()?;
    let total: usize = counts.iter().sum();
    if total > num_timesteps {
        return Err(DiffusionError::config(format!(
            "cannot respace {num_timesteps} steps to {total}"
        )));
    }
    if counts.len() > 1 && num_timesteps % total != 0 {
        return Err(DiffusionError::config(format!(
            "segment counts sum to {total}, which does not divide {num_timesteps}"
        )));
    }

    let size_per = num_timesteps / counts.len();
    let extra = num_timesteps % counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(DiffusionError::config(format!(
                "cannot divide a segment of {size} steps into {section_count}"
            )));
        }
        let frac_stride =
            if section_count <= 1 { 1.0 } else { (size - 1) as f64 / (section_count - 1) as f64 };
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    Ok(all_steps)
}

/// Derives a schedule over `use_timesteps` whose own cumulative products equal
/// the base schedule's at exactly those steps.
pub fn respace_to(base: &NoiseSchedule, use_timesteps: &BTreeSet<usize>) -> Result<NoiseSchedule> {
    if use_timesteps.is_empty() {
        return Err(DiffusionError::config("respacing keeps no timesteps"));
    }
    if let Some(&last) = use_timesteps.iter().next_back() {
        if last >= base.len() {
            return Err(DiffusionError::config(format!(
                "timestep {last} is outside a schedule of {} steps",
                base.len()
            )));
        }
    }
    let mut last_alpha_cumprod = 1.0;
    let mut new_betas = Vec::with_capacity(use_timesteps.len());
    let mut timestep_map = Vec::with_capacity(use_timesteps.len());
    for &i in use_timesteps {
        let alpha_cumprod = base.alphas_cumprod()[i];
        new_betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
        last_alpha_cumprod = alpha_cumprod;
        // keep indices relative to the very first schedule when respacing twice
        timestep_map.push(base.original_timestep(i));
    }
    Ok(NoiseSchedule::from_betas(new_betas)?.with_timestep_map(timestep_map))
}

pub fn respace(base: &NoiseSchedule, section_counts: &str) -> Result<NoiseSchedule> {
    let use_timesteps = space_timesteps(base.len(), section_counts)?;
    let schedule = respace_to(base, &use_timesteps)?;
    info!(section_counts, from = base.len(), to = schedule.len(), "respaced schedule");
    Ok(schedule)
}
