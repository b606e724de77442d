// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The recognized configuration surface: pool size, helper
//! thresholds, and join wait timing. Exposed as a typed, range-checked
//! struct; a string-keyed `set_by_name`/`to_name` pair is kept internally
//! for embedders with a stringly-typed configuration file, matching the
//! interpreter's own product configuration surface (reimplementing that
//! surface itself is out of scope — we only keep the *shape* of that entry
//! point).

use std::fmt;

/// Hard ceiling on concurrent pool threads: N is fixed at startup within
/// an absolute ceiling of 31 concurrent pool threads plus the interpreter
/// thread.
pub const MAX_POOL_THREADS: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamError {
    pub name: &'static str,
    pub reason: &'static str,
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {}", self.name, self.reason)
    }
}

impl std::error::Error for ParamError {}

/// The embedder's startup request. Each
/// field must be ≥1 and strictly less than [`MAX_POOL_THREADS`] + 1; when
/// absent, defaults are 1 active thread and a soft `1.5×active` max.
#[derive(Debug, Clone, Copy)]
pub struct StartupParams {
    pub n_threads: Option<u32>,
    pub n_threads_max: Option<u32>,
}

impl StartupParams {
    /// Resolves defaults and clamps to [`MAX_POOL_THREADS`], returning
    /// `(active, max)`.
    pub fn resolve(&self) -> (u32, u32) {
        let active = self.n_threads.unwrap_or(1).clamp(1, MAX_POOL_THREADS);
        let max = self
            .n_threads_max
            .unwrap_or_else(|| ((active as f64 * 1.5).ceil() as u32).clamp(active, MAX_POOL_THREADS));
        (active, max.clamp(active, MAX_POOL_THREADS))
    }
}

/// Typed view over the options table. Every setter range-checks
/// its argument and returns `Err(ParamError)` instead of silently clamping,
/// except where a sentinel disables a feature by convention (e.g. `<= 0`
/// disabling the join timeout).
#[derive(Debug, Clone, Copy)]
pub struct SchedulerParams {
    renderer_threads: u32,
    max_threads_active: u32,
    max_threads_hard: u32,
    max_threads_limit: u32,
    task_join_wait_ms: i64,
    task_helper_wait_ms: u64,
    task_helper_wait_threshold: u32,
    task_helper_start_threshold: u32,
    task_helper_end_threshold: u32,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            renderer_threads: 1,
            max_threads_active: 1,
            max_threads_hard: MAX_POOL_THREADS,
            max_threads_limit: MAX_POOL_THREADS,
            task_join_wait_ms: 50,
            task_helper_wait_ms: 10,
            task_helper_wait_threshold: 256,
            task_helper_start_threshold: 64,
            task_helper_end_threshold: 8,
        }
    }
}

impl SchedulerParams {
    pub fn renderer_threads(&self) -> u32 {
        self.renderer_threads
    }

    pub fn set_renderer_threads(&mut self, value: u32) -> Result<(), ParamError> {
        if value == 0 || value > self.max_threads_limit {
            return Err(ParamError { name: "RendererThreads", reason: "must be in 1..=MaxThreadsLimit" });
        }
        self.renderer_threads = value;
        Ok(())
    }

    pub fn max_threads_active(&self) -> u32 {
        self.max_threads_active
    }

    pub fn max_threads_hard(&self) -> u32 {
        self.max_threads_hard
    }

    /// Sets either a scalar (active only) or `[active, max]` pair; both are
    /// clipped to the startup limits and to `MaxThreadsLimit`.
    pub fn set_max_threads(&mut self, active: u32, max: Option<u32>) -> Result<(), ParamError> {
        if active == 0 {
            return Err(ParamError { name: "MaxThreads", reason: "active must be >= 1" });
        }
        let limit = self.max_threads_limit.min(MAX_POOL_THREADS);
        let active = active.min(limit);
        let max = max.unwrap_or(active).max(active).min(limit);
        self.max_threads_active = active;
        self.max_threads_hard = max;
        Ok(())
    }

    pub fn max_threads_limit(&self) -> u32 {
        self.max_threads_limit
    }

    /// "Password-encoded upper bound" in the original: here just a
    /// privileged setter an embedder calls once at startup before exposing
    /// the rest of the surface to untrusted configuration.
    pub fn set_max_threads_limit(&mut self, value: u32) -> Result<(), ParamError> {
        if value == 0 || value > MAX_POOL_THREADS {
            return Err(ParamError { name: "MaxThreadsLimit", reason: "must be in 1..=31" });
        }
        self.max_threads_limit = value;
        self.max_threads_active = self.max_threads_active.min(value);
        self.max_threads_hard = self.max_threads_hard.min(value);
        Ok(())
    }

    /// `<= 0` disables timed wait (join blocks indefinitely).
    pub fn task_join_wait(&self) -> Option<std::time::Duration> {
        (self.task_join_wait_ms > 0).then(|| std::time::Duration::from_millis(self.task_join_wait_ms as u64))
    }

    pub fn set_task_join_wait_milliseconds(&mut self, value: i64) -> Result<(), ParamError> {
        self.task_join_wait_ms = value;
        Ok(())
    }

    /// `0` disables the helper.
    pub fn task_helper_wait(&self) -> Option<std::time::Duration> {
        (self.task_helper_wait_ms > 0).then(|| std::time::Duration::from_millis(self.task_helper_wait_ms))
    }

    pub fn set_task_helper_wait_milliseconds(&mut self, value: u64) -> Result<(), ParamError> {
        self.task_helper_wait_ms = value;
        Ok(())
    }

    pub fn task_helper_wait_threshold(&self) -> u32 {
        self.task_helper_wait_threshold
    }

    pub fn set_task_helper_wait_threshold(&mut self, value: u32) -> Result<(), ParamError> {
        self.task_helper_wait_threshold = value;
        Ok(())
    }

    pub fn task_helper_start_threshold(&self) -> u32 {
        self.task_helper_start_threshold
    }

    pub fn set_task_helper_start_threshold(&mut self, value: u32) -> Result<(), ParamError> {
        if value > self.task_helper_wait_threshold {
            return Err(ParamError {
                name: "TaskHelperStartThreshold",
                reason: "must be <= TaskHelperWaitThreshold",
            });
        }
        self.task_helper_start_threshold = value;
        Ok(())
    }

    pub fn task_helper_end_threshold(&self) -> u32 {
        self.task_helper_end_threshold
    }

    pub fn set_task_helper_end_threshold(&mut self, value: u32) -> Result<(), ParamError> {
        if value > self.task_helper_start_threshold {
            return Err(ParamError {
                name: "TaskHelperEndThreshold",
                reason: "must be <= TaskHelperStartThreshold",
            });
        }
        self.task_helper_end_threshold = value;
        Ok(())
    }

    /// String-keyed entry point for embedders with a stringly-typed config
    /// file, keyed by symbolic name.
    pub fn set_by_name(&mut self, name: &str, value: i64) -> Result<(), ParamError> {
        match name {
            "RendererThreads" => self.set_renderer_threads(value as u32),
            "MaxThreadsLimit" => self.set_max_threads_limit(value as u32),
            "TaskJoinWaitMilliseconds" => self.set_task_join_wait_milliseconds(value),
            "TaskHelperWaitMilliseconds" => self.set_task_helper_wait_milliseconds(value.max(0) as u64),
            "TaskHelperWaitThreshold" => self.set_task_helper_wait_threshold(value as u32),
            "TaskHelperStartThreshold" => self.set_task_helper_start_threshold(value as u32),
            "TaskHelperEndThreshold" => self.set_task_helper_end_threshold(value as u32),
            _ => Err(ParamError { name: "unknown", reason: "no such option" }),
        }
    }

    /// The reverse of `set_by_name`: every recognized option paired with its
    /// current value, for embedders that serialize the live configuration
    /// back out to their string-keyed store.
    pub fn to_name_value_pairs(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("RendererThreads", self.renderer_threads as i64),
            ("MaxThreadsLimit", self.max_threads_limit as i64),
            ("TaskJoinWaitMilliseconds", self.task_join_wait_ms),
            ("TaskHelperWaitMilliseconds", self.task_helper_wait_ms as i64),
            ("TaskHelperWaitThreshold", self.task_helper_wait_threshold as i64),
            ("TaskHelperStartThreshold", self.task_helper_start_threshold as i64),
            ("TaskHelperEndThreshold", self.task_helper_end_threshold as i64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_defaults_resolve() {
        let params = StartupParams { n_threads: None, n_threads_max: None };
        assert_eq!(params.resolve(), (1, 2));
    }

    #[test]
    fn startup_params_clamp_to_hard_ceiling() {
        let params = StartupParams { n_threads: Some(40), n_threads_max: Some(50) };
        let (active, max) = params.resolve();
        assert_eq!(active, MAX_POOL_THREADS);
        assert_eq!(max, MAX_POOL_THREADS);
    }

    #[test]
    fn threshold_setters_enforce_ordering() {
        let mut p = SchedulerParams::default();
        assert!(p.set_task_helper_start_threshold(1000).is_err());
        assert!(p.set_task_helper_end_threshold(p.task_helper_start_threshold() + 1).is_err());
    }

    #[test]
    fn join_wait_of_zero_or_less_disables_timeout() {
        let mut p = SchedulerParams::default();
        p.set_task_join_wait_milliseconds(0).unwrap();
        assert_eq!(p.task_join_wait(), None);
        p.set_task_join_wait_milliseconds(-5).unwrap();
        assert_eq!(p.task_join_wait(), None);
    }

    #[test]
    fn set_by_name_round_trips() {
        let mut p = SchedulerParams::default();
        p.set_by_name("TaskHelperWaitMilliseconds", 123).unwrap();
        assert_eq!(p.task_helper_wait(), Some(std::time::Duration::from_millis(123)));
        assert!(p.set_by_name("Nonsense", 1).is_err());
    }
}
