//! The in-process guard around non-idempotent session work.
//!
//! ```text
//!   CONFLICT ──swap──▶ _CONFLICT ──op──▶ READY   (Ok(Settle::Ready))
//!                                  ├──▶ (gone)  (Ok(Settle::Remove))
//!                                  └──▶ ERROR   (Err, or panic in op)
//! ```
//!
//! The swap into the shadow state is a version-checked update, so two callers
//! racing on the same triple cannot both enter. A record already in a shadow
//! state is refused with [`PrearcError::SessionBusy`].

use tracing::{info, warn};

use crate::error::{PrearcError, Result};
use crate::status::PrearcStatus;
use crate::store::SessionStore;
use crate::types::{SessionRecord, Triple};

use super::Prearchive;

const SETTLE_ATTEMPTS: usize = 3;

/// How a successful transition leaves the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Ready,
    /// Soft-delete the record; its policy fields survive for re-arrival.
    Remove,
}

/// Puts the record in ERROR if `op` unwinds before the guard is disarmed.
struct ShadowGuard<'a> {
    store: &'a dyn SessionStore,
    triple: &'a Triple,
    armed: bool,
}

impl ShadowGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ShadowGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = write_status(self.store, self.triple, PrearcStatus::Error) {
            warn!(session = %self.triple, error = %err, "Failed to settle aborted transition");
        }
    }
}

/// Sets `status` on the current record, re-reading on version conflicts.
/// `Ok(None)` if there is no record.
pub(crate) fn write_status(
    store: &dyn SessionStore,
    triple: &Triple,
    status: PrearcStatus,
) -> Result<Option<SessionRecord>> {
    write_settled(store, triple, status, |_| {})
}

/// Like [`write_status`], applying `fill` to each freshly read record first.
fn write_settled(
    store: &dyn SessionStore,
    triple: &Triple,
    status: PrearcStatus,
    fill: impl Fn(&mut SessionRecord),
) -> Result<Option<SessionRecord>> {
    let mut last_err = None;
    for _ in 0..SETTLE_ATTEMPTS {
        let Some(mut record) = store.get(triple)? else {
            return Ok(None);
        };
        fill(&mut record);
        record.status = status;
        match store.update(&record) {
            Ok(updated) => return Ok(Some(updated)),
            Err(err @ PrearcError::StaleRecord { .. }) => last_err = Some(err),
            Err(PrearcError::SessionNotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| PrearcError::SessionNotFound(triple.clone())))
}

/// Copies onto `record` each field that differs between `before` and `after`.
fn reapply_changes(record: &mut SessionRecord, before: &SessionRecord, after: &SessionRecord) {
    if after.subject != before.subject {
        record.subject = after.subject.clone();
    }
    if after.tag != before.tag {
        record.tag = after.tag.clone();
    }
    if after.source != before.source {
        record.source = after.source.clone();
    }
    if after.auto_archive != before.auto_archive {
        record.auto_archive = after.auto_archive;
    }
    if after.prevent_anon != before.prevent_anon {
        record.prevent_anon = after.prevent_anon;
    }
    if after.prevent_auto_commit != before.prevent_auto_commit {
        record.prevent_auto_commit = after.prevent_auto_commit;
    }
}

impl Prearchive {
    /// Runs `op` with the record held in the in-process shadow of `operation`.
    ///
    /// `op` receives the shadow record and may change its non-status fields;
    /// those changes are written back with the final status. Failures leave
    /// the record in ERROR and a note in the session log.
    pub fn run_transition<F>(
        &self,
        triple: &Triple,
        operation: PrearcStatus,
        op: F,
    ) -> Result<Option<SessionRecord>>
    where
        F: FnOnce(&mut SessionRecord) -> Result<Settle>,
    {
        let shadow = self
            .statuses
            .in_process(operation)
            .ok_or(PrearcError::NoShadowState(operation))?;

        let current = self
            .store
            .get(triple)?
            .ok_or_else(|| PrearcError::SessionNotFound(triple.clone()))?;
        if current.status.is_in_process() {
            return Err(PrearcError::SessionBusy {
                triple: triple.clone(),
                status: current.status,
            });
        }

        let mut pending = current;
        pending.status = shadow;
        let mut pending = self.store.update(&pending)?;
        info!(session = %triple, status = %shadow, "Transition started");

        let guard = ShadowGuard {
            store: self.store.as_ref(),
            triple,
            armed: true,
        };
        let entered = pending.clone();
        let outcome = op(&mut pending);
        guard.disarm();

        match outcome {
            Ok(Settle::Ready) => {
                pending.status = PrearcStatus::Ready;
                let settled = match self.store.update(&pending) {
                    Ok(record) => Some(record),
                    Err(PrearcError::StaleRecord { .. }) => {
                        // Written underneath us mid-operation: keep both sides' edits.
                        write_settled(self.store.as_ref(), triple, PrearcStatus::Ready, |record| {
                            reapply_changes(record, &entered, &pending)
                        })?
                    }
                    Err(err) => return Err(err),
                };
                info!(session = %triple, status = %PrearcStatus::Ready, "Transition finished");
                Ok(settled)
            }
            Ok(Settle::Remove) => {
                self.store.delete(triple)?;
                info!(session = %triple, "Transition finished, record removed");
                Ok(None)
            }
            Err(err) => {
                warn!(session = %triple, status = %shadow, error = %err, "Transition failed");
                if let Err(settle_err) =
                    write_status(self.store.as_ref(), triple, PrearcStatus::Error)
                {
                    warn!(session = %triple, error = %settle_err, "Failed to mark session ERROR");
                }
                if let Err(log_err) = self
                    .logs
                    .append(triple, &format!("{operation} failed: {err}"))
                {
                    warn!(session = %triple, error = %log_err, "Failed to write session log");
                }
                Err(err)
            }
        }
    }
}
