//! Process-wide stored-procedure registry (§4.5): `pre_register` before
//! engine init, `get` afterwards, immutable once the engine has started.
//! Grounded on the teacher's handler dispatch table shape
//! (`engines/handler.rs`'s trait-object registry), generalized from "one
//! handler per engine type" to "one function pointer per procedure name".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::procedure::ProcedureContext;

pub type ProcedureFn = fn(&mut ProcedureContext) -> Result<()>;

pub struct ProcManager {
    procedures: RwLock<HashMap<String, ProcedureFn>>,
    started: AtomicBool,
}

impl ProcManager {
    pub fn new() -> Self {
        Self {
            procedures: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Registers `name` -> `func`. Must be called before `mark_started`; the
    /// registry is immutable for the remainder of the engine's lifetime
    /// after that, matching §4.5's "registrations are immutable after init".
    pub fn pre_register(&self, name: impl Into<String>, func: ProcedureFn) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(engine_error!(
                ErrorCode::DependentModuleUnavailableInit,
                "cannot register procedures after engine init"
            ));
        }
        let name = name.into();
        self.procedures
            .write()
            .expect("proc registry lock poisoned")
            .insert(name, func);
        Ok(())
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn get(&self, name: &str) -> Result<ProcedureFn> {
        self.procedures
            .read()
            .expect("proc registry lock poisoned")
            .get(name)
            .copied()
            .ok_or_else(|| engine_error!(ErrorCode::ProcNotFound, "no procedure registered as '{}'", name))
    }
}

impl Default for ProcManager {
    fn default() -> Self {
        Self::new()
    }
}
