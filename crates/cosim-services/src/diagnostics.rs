//! Clamp diagnostics: counts rig contact points that fell outside the
//! terrain patch and were given zero force.

/// Running count of out-of-bounds contact points.
#[derive(Debug, Clone, Default)]
pub struct ClampDiagnostics {
    verbose: bool,
    total: u64,
    steps_with_clamps: u64,
    current_step: Option<u64>,
    current_count: u64,
    max_excursion: f64,
}

impl ClampDiagnostics {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Default::default()
        }
    }

    /// Record one clamped point. `excursion` is its horizontal distance to
    /// the patch.
    pub fn record(&mut self, step: u64, node: usize, excursion: f64) {
        if self.current_step != Some(step) {
            self.flush_step();
            self.current_step = Some(step);
            self.steps_with_clamps += 1;
        }
        self.current_count += 1;
        self.total += 1;
        self.max_excursion = self.max_excursion.max(excursion);

        tracing::trace!(step, node, excursion, "contact point outside patch");
    }

    /// Close out the current step, logging its count when verbose.
    pub fn flush_step(&mut self) {
        if let Some(step) = self.current_step.take() {
            if self.verbose && self.current_count > 0 {
                tracing::warn!(
                    step,
                    clamped = self.current_count,
                    "rig contact points outside terrain patch, zero force applied"
                );
            }
        }
        self.current_count = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn steps_with_clamps(&self) -> u64 {
        self.steps_with_clamps
    }

    pub fn max_excursion(&self) -> f64 {
        self.max_excursion
    }

    /// Log totals for the run, if anything was clamped.
    pub fn log_summary(&self) {
        if self.total > 0 {
            tracing::info!(
                clamped_points = self.total,
                steps_with_clamps = self.steps_with_clamps,
                max_excursion = self.max_excursion,
                "clamp diagnostics"
            );
        }
    }
}
