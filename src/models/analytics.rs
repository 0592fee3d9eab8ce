use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-platform counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformStats {
    pub total: u64,
    pub success: u64,
    /// Running mean build time in seconds
    pub avg_time: f64,
}

/// Running build statistics, updated once per completed build.
///
/// Averages are maintained incrementally (`mean += (x - mean) / n`) so the
/// full duration history never has to be kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildAnalytics {
    pub total_builds: u64,
    pub successful_builds: u64,
    pub failed_builds: u64,
    /// Seconds
    pub average_build_time: f64,
    /// Seconds
    pub last_build_duration: f64,
    pub platform_stats: IndexMap<String, PlatformStats>,
}

impl BuildAnalytics {
    /// Fold one finished build into the counters
    ///
    /// # Arguments
    /// * `duration` - Wall-clock time from start to end of the attempt
    /// * `success` - Final outcome of the attempt
    /// * `platforms` - Platforms snapshotted on the build record when it started
    pub fn record_build(&mut self, duration: Duration, success: bool, platforms: &[String]) {
        let secs = duration.as_secs_f64();

        self.total_builds += 1;
        if success {
            self.successful_builds += 1;
        } else {
            self.failed_builds += 1;
        }
        self.average_build_time = running_mean(self.average_build_time, secs, self.total_builds);
        self.last_build_duration = secs;

        for platform in platforms {
            let stats = self.platform_stats.entry(platform.clone()).or_default();
            stats.total += 1;
            if success {
                stats.success += 1;
            }
            stats.avg_time = running_mean(stats.avg_time, secs, stats.total);
        }
    }

    /// Fraction of builds that succeeded, 0.0 when nothing has run
    pub fn success_rate(&self) -> f64 {
        if self.total_builds == 0 {
            0.0
        } else {
            self.successful_builds as f64 / self.total_builds as f64
        }
    }
}

fn running_mean(mean: f64, sample: f64, count: u64) -> f64 {
    mean + (sample - mean) / count as f64
}
