//! Blocking queries.
//!
//! A query with a nonzero `min_index` re-runs until its result index passes
//! `min_index` or its wait elapses. Wakeups come from the store's table
//! index channel; the receiver is marked seen before every run so a write
//! landing between the run and the wait is never missed.

use super::{QuerySettings, VariablesService};
use crate::core::error::VarResult;
use crate::core::time::deadline_after;
use crate::state::store::VariableStateStore;
use crate::vars::ops::{QueryMeta, QueryOptions};
use rand::Rng;
use std::time::Duration;

impl QuerySettings {
    /// Wait for a query: requested or default, capped, plus random jitter.
    pub fn wait_for(&self, requested: Option<Duration>) -> Duration {
        let base = requested
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_max_query_time)
            .min(self.max_query_time);
        base.saturating_add(self.jitter(base))
    }

    fn jitter(&self, base: Duration) -> Duration {
        if self.jitter_fraction == 0 {
            return Duration::ZERO;
        }
        let bound = base / self.jitter_fraction;
        let nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }
}

impl VariablesService {
    /// Run `run` against the store, blocking per `opts`.
    ///
    /// `run` returns a result and the index it reflects. On timeout the last
    /// result is returned with its index, which may not exceed `min_index`.
    pub(crate) async fn blocking_query<T>(
        &self,
        opts: &QueryOptions,
        mut run: impl FnMut(&VariableStateStore) -> VarResult<(T, u64)>,
    ) -> VarResult<(T, QueryMeta)> {
        if opts.min_index == 0 {
            let (value, index) = run(&self.store)?;
            return Ok((value, self.query_meta(index)));
        }

        let deadline = deadline_after(self.settings.query.wait_for(opts.max_query_time));
        let mut changes = self.store.subscribe();
        loop {
            changes.borrow_and_update();
            let (value, index) = run(&self.store)?;
            if index > opts.min_index {
                return Ok((value, self.query_meta(index)));
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                // Store dropped or wait elapsed: answer with what we have.
                Ok(Err(_)) | Err(_) => return Ok((value, self.query_meta(index))),
            }
        }
    }

    fn query_meta(&self, index: u64) -> QueryMeta {
        QueryMeta {
            index,
            last_contact: Duration::ZERO,
            known_leader: self.timers.is_leader(),
        }
    }
}
