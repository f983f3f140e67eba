// ============================================================================
// BACKEND NEGOTIATION: find an execution backend for each inference service
// ============================================================================
//
// Each service walks the configured backend order until one initialises.
// The two services negotiate on separate jobs and never wait on each other.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::segmentation::service::{BackgroundRemovalService, SegmentationService};
use crate::tasks::TaskRunner;

/// Execution providers in rough order of preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionBackend {
    Cuda,
    DirectMl,
    CoreMl,
    Cpu,
    /// Portable fallback that needs no native runtime.
    Software,
}

impl ExecutionBackend {
    pub fn all() -> &'static [ExecutionBackend] {
        &[
            ExecutionBackend::Cuda,
            ExecutionBackend::DirectMl,
            ExecutionBackend::CoreMl,
            ExecutionBackend::Cpu,
            ExecutionBackend::Software,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionBackend::Cuda => "cuda",
            ExecutionBackend::DirectMl => "directml",
            ExecutionBackend::CoreMl => "coreml",
            ExecutionBackend::Cpu => "cpu",
            ExecutionBackend::Software => "software",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::all().iter().copied().find(|b| b.name() == s)
    }

    /// Parse a comma separated list. Unknown names and repeats are skipped.
    pub fn parse_list(s: &str) -> Vec<Self> {
        let mut out = Vec::new();
        for b in s.split(',').filter_map(Self::parse) {
            if !out.contains(&b) {
                out.push(b);
            }
        }
        out
    }

}

impl std::fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One failed initialisation.
#[derive(Clone, Debug, PartialEq)]
pub struct Attempt<B> {
    pub backend: B,
    pub error: EngineError,
}

/// Call `init` on each candidate in order and return the first success.
/// On exhaustion every failure is returned, in order.
pub fn try_in_order<B, T, I, F>(candidates: I, mut init: F) -> Result<(B, T), Vec<Attempt<B>>>
where
    I: IntoIterator<Item = B>,
    B: Copy,
    F: FnMut(B) -> Result<T, EngineError>,
{
    let mut failures = Vec::new();
    for backend in candidates {
        match init(backend) {
            Ok(handle) => return Ok((backend, handle)),
            Err(error) => failures.push(Attempt { backend, error }),
        }
    }
    Err(failures)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Segmentation,
    BackgroundRemoval,
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Segmentation => "Segmentation",
            ServiceKind::BackgroundRemoval => "Background removal",
        }
    }

    fn slot(&self) -> usize {
        match self {
            ServiceKind::Segmentation => 0,
            ServiceKind::BackgroundRemoval => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub enum NegotiationStatus {
    #[default]
    Idle,
    Pending,
    Ready(ExecutionBackend),
    /// Every backend failed. Terminal for the service: later `start_*`
    /// calls are refused.
    Unavailable(String),
}

/// A service handle produced by negotiation.
#[derive(Clone)]
pub enum NegotiatedService {
    Segmentation(Arc<dyn SegmentationService>),
    BackgroundRemoval(Arc<dyn BackgroundRemovalService>),
}

impl NegotiatedService {
    pub fn kind(&self) -> ServiceKind {
        match self {
            NegotiatedService::Segmentation(_) => ServiceKind::Segmentation,
            NegotiatedService::BackgroundRemoval(_) => ServiceKind::BackgroundRemoval,
        }
    }
}

struct NegotiationEvent {
    kind: ServiceKind,
    outcome: Result<(ExecutionBackend, NegotiatedService), Vec<Attempt<ExecutionBackend>>>,
}

fn summarize(attempts: &[Attempt<ExecutionBackend>]) -> String {
    if attempts.is_empty() {
        return "no backends configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.backend, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Negotiator {
    order: Vec<ExecutionBackend>,
    runner: TaskRunner,
    statuses: [NegotiationStatus; 2],
    failures: [Vec<Attempt<ExecutionBackend>>; 2],
    sender: Sender<NegotiationEvent>,
    receiver: Receiver<NegotiationEvent>,
}

impl Negotiator {
    pub fn new(runner: TaskRunner, order: Vec<ExecutionBackend>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            order,
            runner,
            statuses: Default::default(),
            failures: Default::default(),
            sender,
            receiver,
        }
    }

    pub fn order(&self) -> &[ExecutionBackend] {
        &self.order
    }

    pub fn status(&self, kind: ServiceKind) -> &NegotiationStatus {
        &self.statuses[kind.slot()]
    }

    /// Failed attempts from the last negotiation of `kind`, in try order.
    pub fn failures(&self, kind: ServiceKind) -> &[Attempt<ExecutionBackend>] {
        &self.failures[kind.slot()]
    }

    pub fn is_pending(&self) -> bool {
        self.statuses.iter().any(|s| *s == NegotiationStatus::Pending)
    }

    pub fn status_line(&self, kind: ServiceKind) -> String {
        match self.status(kind) {
            NegotiationStatus::Idle => format!("{}: not started", kind.label()),
            NegotiationStatus::Pending => format!("{}: initialising…", kind.label()),
            NegotiationStatus::Ready(b) => format!("{}: ready ({})", kind.label(), b),
            NegotiationStatus::Unavailable(msg) => {
                format!("{}: no backend available ({})", kind.label(), msg)
            }
        }
    }

    pub fn start_segmentation<F>(&mut self, init: F) -> bool
    where
        F: Fn(ExecutionBackend) -> Result<Arc<dyn SegmentationService>, EngineError> + Send + 'static,
    {
        self.start(ServiceKind::Segmentation, move |b| {
            init(b).map(NegotiatedService::Segmentation)
        })
    }

    pub fn start_background_removal<F>(&mut self, init: F) -> bool
    where
        F: Fn(ExecutionBackend) -> Result<Arc<dyn BackgroundRemovalService>, EngineError>
            + Send
            + 'static,
    {
        self.start(ServiceKind::BackgroundRemoval, move |b| {
            init(b).map(NegotiatedService::BackgroundRemoval)
        })
    }

    /// Kick off negotiation for one service. Returns false if it is already
    /// running, has succeeded, or has exhausted every backend.
    fn start<F>(&mut self, kind: ServiceKind, init: F) -> bool
    where
        F: Fn(ExecutionBackend) -> Result<NegotiatedService, EngineError> + Send + 'static,
    {
        if matches!(
            self.statuses[kind.slot()],
            NegotiationStatus::Pending | NegotiationStatus::Ready(_) | NegotiationStatus::Unavailable(_)
        ) {
            return false;
        }
        self.statuses[kind.slot()] = NegotiationStatus::Pending;
        self.failures[kind.slot()].clear();
        let order = self.order.clone();
        let tx = self.sender.clone();
        log_info!(
            "Backend: negotiating {} over [{}]",
            kind.label(),
            order.iter().map(|b| b.name()).collect::<Vec<_>>().join(", ")
        );
        self.runner.spawn(move || {
            let outcome = try_in_order(order, |backend| {
                let result = init(backend);
                if let Err(e) = &result {
                    log_warn!("Backend: {} on {} failed: {}", kind.label(), backend, e);
                }
                result
            });
            let _ = tx.send(NegotiationEvent { kind, outcome });
        });
        true
    }

    /// Apply finished negotiations and return the services that became ready.
    pub fn poll(&mut self) -> Vec<NegotiatedService> {
        let mut ready = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            if let Some(service) = self.handle(event) {
                ready.push(service);
            }
        }
        ready
    }

    pub fn wait_until_idle(&mut self, timeout: Duration) -> Vec<NegotiatedService> {
        let deadline = Instant::now() + timeout;
        let mut ready = self.poll();
        while self.is_pending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(event) => ready.extend(self.handle(event)),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        ready
    }

    fn handle(&mut self, event: NegotiationEvent) -> Option<NegotiatedService> {
        let slot = event.kind.slot();
        match event.outcome {
            Ok((backend, service)) => {
                log_info!("Backend: {} ready on {}", event.kind.label(), backend);
                self.statuses[slot] = NegotiationStatus::Ready(backend);
                Some(service)
            }
            Err(attempts) => {
                let summary = summarize(&attempts);
                log_err!("Backend: {} unavailable: {}", event.kind.label(), summary);
                self.statuses[slot] = NegotiationStatus::Unavailable(summary);
                self.failures[slot] = attempts;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::service::{
        AlphaMatte, Embedding, EmbeddingOutput, MaskPrediction, PixelMasks, PreprocessMeta, PromptPoint,
    };
    use image::RgbaImage;

    struct NullSeg;

    impl SegmentationService for NullSeg {
        fn embed(&self, _: &RgbaImage) -> Result<EmbeddingOutput, EngineError> {
            Err(EngineError::Inference("unused".into()))
        }
        fn segment(&self, _: &Embedding, _: &[PromptPoint]) -> Result<MaskPrediction, EngineError> {
            Err(EngineError::Inference("unused".into()))
        }
        fn post_process_masks(&self, _: &MaskPrediction, _: &PreprocessMeta) -> Result<PixelMasks, EngineError> {
            Err(EngineError::Inference("unused".into()))
        }
    }

    struct NullBg;

    impl BackgroundRemovalService for NullBg {
        fn run(&self, _: &RgbaImage) -> Result<AlphaMatte, EngineError> {
            Err(EngineError::Inference("unused".into()))
        }
    }

    #[test]
    fn try_in_order_stops_at_first_success() {
        let mut tried = Vec::new();
        let result = try_in_order([1, 2, 3, 4], |b| {
            tried.push(b);
            if b == 3 { Ok("handle") } else { Err(EngineError::BackendUnavailable(format!("no {}", b))) }
        });
        let (backend, handle) = result.unwrap();
        assert_eq!((backend, handle), (3, "handle"));
        assert_eq!(tried, vec![1, 2, 3]);
    }

    #[test]
    fn try_in_order_reports_every_failure() {
        let result: Result<(u8, ()), _> =
            try_in_order([1u8, 2], |b| Err(EngineError::BackendUnavailable(b.to_string())));
        let failures = result.unwrap_err();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[1].backend, 2);
    }

    #[test]
    fn parse_backend_list() {
        let list = ExecutionBackend::parse_list("CUDA, cpu,bogus,cpu , software");
        assert_eq!(
            list,
            vec![ExecutionBackend::Cuda, ExecutionBackend::Cpu, ExecutionBackend::Software]
        );
    }

    #[test]
    fn services_negotiate_independently() {
        let mut n = Negotiator::new(TaskRunner::Inline, ExecutionBackend::all().to_vec());
        n.start_segmentation(|b| match b {
            ExecutionBackend::Cpu => Ok(Arc::new(NullSeg) as Arc<dyn SegmentationService>),
            _ => Err(EngineError::BackendUnavailable("missing provider".into())),
        });
        n.start_background_removal(|_| -> Result<Arc<dyn BackgroundRemovalService>, EngineError> {
            Err(EngineError::BackendUnavailable("no model".into()))
        });
        assert!(n.is_pending());
        let ready = n.poll();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind(), ServiceKind::Segmentation);
        assert_eq!(*n.status(ServiceKind::Segmentation), NegotiationStatus::Ready(ExecutionBackend::Cpu));
        assert!(matches!(n.status(ServiceKind::BackgroundRemoval), NegotiationStatus::Unavailable(_)));
        assert_eq!(n.failures(ServiceKind::BackgroundRemoval).len(), 5);
        assert!(n.status_line(ServiceKind::BackgroundRemoval).contains("no backend available"));
    }

    #[test]
    fn ready_service_is_not_renegotiated() {
        let mut n = Negotiator::new(TaskRunner::Inline, vec![ExecutionBackend::Software]);
        assert!(n.start_background_removal(|_| Ok(Arc::new(NullBg) as Arc<dyn BackgroundRemovalService>)));
        n.poll();
        assert!(!n.start_background_removal(|_| Ok(Arc::new(NullBg) as Arc<dyn BackgroundRemovalService>)));
    }

    #[test]
    fn exhausted_service_stays_unavailable() {
        let mut n = Negotiator::new(TaskRunner::Inline, vec![ExecutionBackend::Cpu]);
        assert!(n.start_background_removal(|_| -> Result<Arc<dyn BackgroundRemovalService>, EngineError> {
            Err(EngineError::BackendUnavailable("no model".into()))
        }));
        assert!(n.poll().is_empty());
        assert!(!n.start_background_removal(|_| Ok(Arc::new(NullBg) as Arc<dyn BackgroundRemovalService>)));
        assert!(!n.is_pending());
        assert!(matches!(n.status(ServiceKind::BackgroundRemoval), NegotiationStatus::Unavailable(_)));
    }
}
