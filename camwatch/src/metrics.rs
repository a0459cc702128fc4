//! Pull-based host metrics for overlay text.

use parking_lot::Mutex;
use sysinfo::System;

/// Anything that can describe itself as ordered `(label, value)` overlay rows.
pub trait MetricsSource: Send + Sync {
    fn current_metrics(&self) -> Vec<(String, String)>;
}

/// Host CPU and memory usage, one decimal place, e.g. `CPU: 12.5%`.
pub struct SystemMetrics {
    system: Mutex<System>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetrics {
    fn current_metrics(&self) -> Vec<(String, String)> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        // average across all cores, usage since the previous call
        let cpus = system.cpus();
        let cpu = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let ram = percent(system.used_memory(), system.total_memory());

        vec![
            ("CPU".to_string(), format!("{cpu:.1}%")),
            ("RAM".to_string(), format!("{ram:.1}%")),
        ]
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Fixed rows, handy when the overlay should carry static text.
impl MetricsSource for Vec<(String, String)> {
    fn current_metrics(&self) -> Vec<(String, String)> {
        self.clone()
    }
}
