use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use ta_task_core::{AnalysisRequest, StageTable};

use crate::analysis::{AnalysisEngine, ProgressReporter};
use crate::supervisor::ThreadSupervisor;
use crate::tracker::ProgressTracker;

pub(crate) struct WorkerContext {
    pub(crate) task_id: String,
    pub(crate) request: AnalysisRequest,
    pub(crate) tracker: Arc<ProgressTracker>,
    pub(crate) supervisor: Arc<ThreadSupervisor>,
    pub(crate) engine: Arc<dyn AnalysisEngine>,
}

/// Unregisters the worker however the body exits, including by unwinding.
struct RegistrationGuard {
    supervisor: Arc<ThreadSupervisor>,
    task_id: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.supervisor.unregister(&self.task_id);
    }
}

pub(crate) fn spawn_worker(runtime: &Handle, ctx: WorkerContext) -> JoinHandle<()> {
    runtime.spawn_blocking(move || run_worker(ctx))
}

fn run_worker(ctx: WorkerContext) {
    let _registration = RegistrationGuard {
        supervisor: ctx.supervisor.clone(),
        task_id: ctx.task_id.clone(),
    };

    ctx.tracker.update(&ctx.task_id, "starting analysis", None);
    let reporter = ProgressReporter::new(
        ctx.tracker.clone(),
        ctx.task_id.clone(),
        StageTable::for_request(&ctx.request),
    );

    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        ctx.engine.analyze(&ctx.request, &reporter)
    }));
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(output)) => {
            info!(
                task_id = %ctx.task_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "analysis finished"
            );
            ctx.tracker.mark_completed_with_output(
                &ctx.task_id,
                "analysis complete",
                output.decision,
                output.raw,
            );
        }
        Ok(Err(err)) => {
            debug!(task_id = %ctx.task_id, "engine returned an error: {err:#}");
            ctx.tracker.mark_failed(&ctx.task_id, err.to_string());
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            ctx.tracker
                .mark_failed(&ctx.task_id, format!("analysis engine panicked: {reason}"));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let err = catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "static message");

        let code = 7;
        let err = catch_unwind(|| panic!("formatted {code}")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "formatted 7");

        let err = catch_unwind(|| std::panic::panic_any(42_u32)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "unknown panic");
    }
}
