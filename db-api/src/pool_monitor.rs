use std::time::Duration;

use sqlx::PgPool;
use tokio::time::interval;

use crate::metrics::{POOL_ACTIVE, POOL_IDLE, POOL_MAX};

/// Periodically publishes connection pool usage as gauges.
pub struct PoolMonitor {
    pool: PgPool,
    period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub active: u32,
    pub idle: u32,
    pub max: u32,
}

impl PoolUsage {
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        f64::from(self.active) / f64::from(self.max)
    }
}

impl PoolMonitor {
    pub fn new(pool: PgPool, period: Duration) -> Self {
        Self { pool, period }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.period);
        tracing::debug!("starting database connection pool monitoring");

        loop {
            ticker.tick().await;
            self.record(self.usage());
        }
    }

    pub fn usage(&self) -> PoolUsage {
        let size = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX);

        PoolUsage {
            active: size.saturating_sub(idle),
            idle,
            max: self.pool.options().get_max_connections(),
        }
    }

    fn record(&self, usage: PoolUsage) {
        metrics::gauge!(POOL_ACTIVE).set(f64::from(usage.active));
        metrics::gauge!(POOL_IDLE).set(f64::from(usage.idle));
        metrics::gauge!(POOL_MAX).set(f64::from(usage.max));

        tracing::debug!(
            "pool metrics - active: {}, idle: {}, max: {}",
            usage.active,
            usage.idle,
            usage.max
        );

        if usage.utilization() > 0.8 {
            tracing::warn!(
                "high pool utilization: {:.1}% ({}/{})",
                usage.utilization() * 100.0,
                usage.active,
                usage.max
            );
        }
    }
}
