//! Job dispatch gate
//!
//! With auto-update on, a worker only runs jobs once `is_allowing_job` is
//! set. Until then every job is deferred back to the server and the first
//! one asks for a restart, so work never runs on a process whose code is
//! about to be replaced.

use super::LoopState;
use crate::connector::Dispatch;
use crate::context::DaemonContext;
use crate::jobs::JobOutcome;
use crate::restart::RestartTrigger;

pub struct GatedDispatch<'a> {
    ctx: &'a mut DaemonContext,
    restart: &'a mut dyn RestartTrigger,
    phase: &'a mut LoopState,
    dispatched: usize,
    deferred: usize,
}

impl<'a> GatedDispatch<'a> {
    pub fn new(
        ctx: &'a mut DaemonContext,
        restart: &'a mut dyn RestartTrigger,
        phase: &'a mut LoopState,
    ) -> Self {
        Self {
            ctx,
            restart,
            phase,
            dispatched: 0,
            deferred: 0,
        }
    }

    /// Jobs handed to their handler
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Jobs sent back undone
    pub fn deferred(&self) -> usize {
        self.deferred
    }

    fn is_gated(&self) -> bool {
        self.ctx.config().auto_update && !self.ctx.state.is_allowing_job
    }
}

impl Dispatch for GatedDispatch<'_> {
    fn dispatch(&mut self, name: &str, payload: &[u8]) -> JobOutcome {
        if self.is_gated() {
            self.deferred += 1;
            if !self.restart.is_pending() {
                if let Err(e) = self.restart.request_restart(self.ctx) {
                    log::error!("{}", e);
                    // Carry on with the configuration we have
                    self.ctx.state.is_allowing_job = true;
                }
            }
            log::debug!("Deferred job {} until restart completes", name);
            return JobOutcome::Deferred;
        }

        *self.phase = LoopState::Dispatching;
        let outcome = self.ctx.registry.dispatch(name, payload);
        *self.phase = LoopState::Polling;
        self.dispatched += 1;
        outcome
    }
}
