//! The three partition serialization strategies.
//!
//! - **Lock**: the calling task takes the partition's spin task-lock and
//!   applies the action in place. Simple, and the contention cost is paid at
//!   the lock.
//! - **Delegate**: the action is posted to the partition's owning core
//!   through its inbox ring; a worker task there applies it, and the caller
//!   blocks on a future for the result. The partition lock never leaves its
//!   home core.
//! - **Combine**: contenders enqueue their actions on a per-partition
//!   lock-free queue; whoever wins the partition lock executes a bounded
//!   batch of queued actions on behalf of everyone, and the others spin
//!   (cooperatively, yielding their core) on their action's done flag.
//!
//! One strategy is selected at configuration time for the whole table; they
//! are mutually exclusive.

use crate::action::{ActionKind, ActionResult, apply};
use crate::partition::{Hint, Partition};
use mm_ring::Mpmc;
use mm_runtime::WorkItem;
use mm_runtime::sync::oneshot;
use mm_runtime::sync::spin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How many queued actions one combine winner executes before releasing the
/// partition lock.
const COMBINER_HANDOFF: usize = 16;

/// Strategy selection, from configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Strategy {
    /// Spin task-lock around the partition, executed in place.
    #[default]
    Lock,
    /// Actions run as work on the partition's owning core.
    Delegate,
    /// Flat combining over a per-partition queue.
    Combine,
}

/// A queued combine request.
pub(crate) struct CombineNode {
    op: spin::Mutex<Option<(u32, ActionKind)>>,
    result: spin::Mutex<Option<ActionResult>>,
    done: AtomicBool,
}

pub(crate) type CombineQueue = Mpmc<Arc<CombineNode>>;

// === impl Strategy ===

impl Strategy {
    /// Runs one action against `part` under this strategy.
    pub(crate) async fn run(
        self,
        part: &Arc<Partition>,
        hash: u32,
        kind: ActionKind,
    ) -> ActionResult {
        match self {
            Strategy::Lock => part.apply_locked(hash, kind),
            Strategy::Delegate => delegate(part, hash, kind).await,
            Strategy::Combine => combine(part, hash, kind).await,
        }
    }
}

/// Posts the action to the partition's owning core and awaits the result.
async fn delegate(part: &Arc<Partition>, hash: u32, kind: ActionKind) -> ActionResult {
    // Already home: no reason to bounce through the ring.
    if mm_runtime::try_core_id() == Some(part.home().id()) {
        return part.apply_locked(hash, kind);
    }

    let (tx, rx) = oneshot::channel();
    let target = part.clone();
    let home = part.home().id();
    part.home().submit(
        WorkItem::new(move || {
            let _ = tx.send(target.apply_locked(hash, kind));
        })
        .pinned_to(home),
    );

    match rx.await {
        Ok(result) => result,
        // The owning core tore down before running the work.
        Err(_) => (Err(crate::StoreError::Shutdown), Hint::default()),
    }
}

/// Flat combining: enqueue, then either win the lock and execute a batch
/// (ours included, usually) or spin on our done flag until a winner did.
async fn combine(part: &Arc<Partition>, hash: u32, kind: ActionKind) -> ActionResult {
    let node = Arc::new(CombineNode {
        op: spin::Mutex::new(Some((hash, kind))),
        result: spin::Mutex::new(None),
        done: AtomicBool::new(false),
    });
    part.combiner.push(node.clone());

    loop {
        if node.done.load(Ordering::Acquire) {
            return node
                .result
                .lock()
                .take()
                .expect("combine node done without result");
        }

        if let Some(mut core) = part.core.try_lock() {
            // We are the combiner: execute a bounded batch on behalf of
            // every queued contender, then hand the lock off.
            let mut handled = 0;
            while handled < COMBINER_HANDOFF {
                let Some(next) = part.combiner.try_pop() else {
                    break;
                };
                let (hash, kind) = next
                    .op
                    .lock()
                    .take()
                    .expect("queued combine node without op");
                let result = apply(&mut core, hash, kind);
                *next.result.lock() = Some(result);
                next.done.store(true, Ordering::Release);
                handled += 1;
            }
        }

        // Not done yet (or not our turn): let the rest of this core run.
        mm_runtime::yield_now().await;
    }
}
