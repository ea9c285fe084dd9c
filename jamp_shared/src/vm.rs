//! Module slot registry.
//!
//! Exactly one module occupies each slot (`Game`, `CGame`, `Ui`). Modules are
//! produced by `ModuleLoader`s registered under the slot's module name; the
//! registry owns what they return and is the only way to reach it.
//!
//! Typical lifecycle:
//! ```ignore
//! let h = vms.create(VmSlot::Game);       // slot allocated (or existing one returned)
//! vms.with_game(|g| g.run_frame(sys, t));  // calls go through the registry
//! let h = vms.restart(h?);                 // same slot, fresh instance
//! vms.free(h);                             // slot emptied; stale handles become no-ops
//! ```

use std::collections::HashMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::game_api::{CGameExport, GameExport, UiExport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmSlot {
    Game,
    CGame,
    Ui,
}

impl VmSlot {
    pub const ALL: [VmSlot; 3] = [VmSlot::Game, VmSlot::CGame, VmSlot::Ui];

    /// Module name resolved by loaders.
    pub fn module_name(self) -> &'static str {
        match self {
            VmSlot::Game => "jampgame",
            VmSlot::CGame => "cgame",
            VmSlot::Ui => "ui",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VmSlot::Game => "GameVM",
            VmSlot::CGame => "CGameVM",
            VmSlot::Ui => "UIVM",
        }
    }

    fn index(self) -> usize {
        match self {
            VmSlot::Game => 0,
            VmSlot::CGame => 1,
            VmSlot::Ui => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("no module named {0}")]
    NotFound(String),
    #[error("module {name} failed to load: {reason}")]
    LoadFailed { name: String, reason: String },
    #[error("module {name} is not a {expected} module")]
    WrongKind { name: String, expected: &'static str },
    #[error("{0} is not loaded")]
    NotLoaded(&'static str),
    #[error("{0} is already executing")]
    Reentrant(&'static str),
}

/// A loaded module of any kind.
pub enum Module {
    Game(Box<dyn GameExport>),
    CGame(Box<dyn CGameExport>),
    Ui(Box<dyn UiExport>),
}

impl Module {
    fn fits(&self, slot: VmSlot) -> bool {
        matches!(
            (self, slot),
            (Module::Game(_), VmSlot::Game) | (Module::CGame(_), VmSlot::CGame) | (Module::Ui(_), VmSlot::Ui)
        )
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Module::Game(_) => "Game",
            Module::CGame(_) => "CGame",
            Module::Ui(_) => "Ui",
        };
        write!(f, "Module::{kind}")
    }
}

/// Produces a module instance by name.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Module, VmError>;
}

impl<F> ModuleLoader for F
where
    F: Fn(&str) -> Result<Module, VmError> + Send + Sync,
{
    fn load(&self, name: &str) -> Result<Module, VmError> {
        self(name)
    }
}

/// Identifies one instance in one slot. A handle outlives its instance
/// harmlessly: operations on a stale handle do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmHandle {
    pub slot: VmSlot,
    instance: u64,
}

#[derive(Debug)]
pub struct Vm {
    pub slot: VmSlot,
    pub name: &'static str,
    instance: u64,
    module: Module,
}

impl Vm {
    pub fn handle(&self) -> VmHandle {
        VmHandle {
            slot: self.slot,
            instance: self.instance,
        }
    }
}

#[derive(Default)]
pub struct VmRegistry {
    loaders: HashMap<String, Box<dyn ModuleLoader>>,
    slots: [Option<Vm>; 3],
    /// The instance whose code is executing, if any.
    current: Option<VmHandle>,
    next_instance: u64,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `name` loadable. Replaces an earlier loader for the same name.
    pub fn register_loader(&mut self, name: &str, loader: impl ModuleLoader + 'static) {
        self.loaders.insert(name.to_string(), Box::new(loader));
    }

    /// Returns the occupant of `slot`, loading it first if the slot is empty.
    /// A failed load leaves the slot empty and yields `None`.
    pub fn create(&mut self, slot: VmSlot) -> Option<VmHandle> {
        if let Some(vm) = &self.slots[slot.index()] {
            return Some(vm.handle());
        }

        let name = slot.module_name();
        let loaded = match self.loaders.get(name) {
            Some(loader) => loader.load(name),
            None => Err(VmError::NotFound(name.to_string())),
        };
        let module = match loaded {
            Ok(m) if m.fits(slot) => m,
            Ok(_) => {
                let e = VmError::WrongKind {
                    name: name.to_string(),
                    expected: slot.label(),
                };
                warn!(vm = name, error = %e, "VM_Create failed!");
                return None;
            }
            Err(e) => {
                warn!(vm = name, error = %e, "VM_Create failed!");
                return None;
            }
        };

        self.next_instance += 1;
        let vm = Vm {
            slot,
            name,
            instance: self.next_instance,
            module,
        };
        let handle = vm.handle();
        self.slots[slot.index()] = Some(vm);
        info!(vm = name, "VM_Create succeeded");
        Some(handle)
    }

    /// Unloads the instance behind `handle`. `None` and stale handles are
    /// ignored.
    pub fn free(&mut self, handle: Option<VmHandle>) {
        let Some(handle) = handle else {
            return;
        };
        let slot = &mut self.slots[handle.slot.index()];
        if slot.as_ref().map(Vm::handle) != Some(handle) {
            return;
        }
        if let Some(vm) = slot.take() {
            info!(vm = vm.name, "VM_Free");
        }
        if self.current == Some(handle) {
            self.current = None;
        }
    }

    /// Frees and recreates the instance in the same slot.
    pub fn restart(&mut self, handle: VmHandle) -> Option<VmHandle> {
        let slot = handle.slot;
        self.free(Some(handle));
        self.create(slot)
    }

    /// Unloads every slot.
    pub fn clear(&mut self) {
        for slot in VmSlot::ALL {
            let handle = self.handle(slot);
            self.free(handle);
        }
        self.current = None;
    }

    pub fn handle(&self, slot: VmSlot) -> Option<VmHandle> {
        self.slots[slot.index()].as_ref().map(Vm::handle)
    }

    pub fn get(&self, handle: VmHandle) -> Option<&Vm> {
        self.slots[handle.slot.index()]
            .as_ref()
            .filter(|vm| vm.instance == handle.instance)
    }

    /// Calls into the loaded server game.
    ///
    /// The registry stays mutably borrowed for the whole call, so a module
    /// cannot be entered again from inside itself:
    ///
    /// ```compile_fail
    /// use jamp_shared::vm::VmRegistry;
    ///
    /// let mut vms = VmRegistry::new();
    /// let _ = vms.with_game(|_outer| {
    ///     let _ = vms.with_game(|_inner| ());
    /// });
    /// ```
    pub fn with_game<R>(&mut self, f: impl FnOnce(&mut dyn GameExport) -> R) -> Result<R, VmError> {
        self.call(VmSlot::Game, |m| match m {
            Module::Game(g) => Some(f(g.as_mut())),
            _ => None,
        })
    }

    /// Calls into the loaded client game.
    pub fn with_cgame<R>(&mut self, f: impl FnOnce(&mut dyn CGameExport) -> R) -> Result<R, VmError> {
        self.call(VmSlot::CGame, |m| match m {
            Module::CGame(g) => Some(f(g.as_mut())),
            _ => None,
        })
    }

    /// Calls into the loaded UI.
    pub fn with_ui<R>(&mut self, f: impl FnOnce(&mut dyn UiExport) -> R) -> Result<R, VmError> {
        self.call(VmSlot::Ui, |m| match m {
            Module::Ui(u) => Some(f(u.as_mut())),
            _ => None,
        })
    }

    /// Read-only access to the server game's shared data.
    pub fn game(&self) -> Option<&dyn GameExport> {
        match self.slots[VmSlot::Game.index()].as_ref().map(|vm| &vm.module) {
            Some(Module::Game(g)) => Some(g.as_ref()),
            _ => None,
        }
    }

    fn call<R>(&mut self, slot: VmSlot, f: impl FnOnce(&mut Module) -> Option<R>) -> Result<R, VmError> {
        let vm = self.slots[slot.index()]
            .as_mut()
            .ok_or(VmError::NotLoaded(slot.label()))?;
        let handle = vm.handle();
        if self.current == Some(handle) {
            return Err(VmError::Reentrant(slot.label()));
        }
        let previous = self.current.replace(handle);
        let out = f(&mut vm.module);
        self.current = previous;
        out.ok_or(VmError::NotLoaded(slot.label()))
    }
}

impl Drop for VmRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
