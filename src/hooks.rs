use crate::error::{EmulatorError, Result};
use crate::machine::Machine;
use std::fmt;
use std::ops::Range;
use tracing::debug;

pub type HookId = usize;

/// Called before an instruction executes with its address and length.
pub type CodeHookFn = Box<dyn FnMut(&mut Machine, u64, usize) -> Result<()>>;

/// Called after a guest data access completes.
pub type MemHookFn = Box<dyn FnMut(&mut Machine, MemAccess) -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    Code,
    MemRead,
    MemWrite,
    /// Both reads and writes.
    MemAccess,
}

impl HookType {
    fn matches(&self, kind: MemAccessKind) -> bool {
        matches!(
            (self, kind),
            (HookType::MemAccess, _)
                | (HookType::MemRead, MemAccessKind::Read)
                | (HookType::MemWrite, MemAccessKind::Write)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccessKind {
    Read,
    Write,
}

/// A completed guest data access. `value` is the loaded value for reads and
/// the stored value for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub kind: MemAccessKind,
    pub address: u64,
    pub size: usize,
    pub value: u64,
}

pub enum HookCallback {
    Code(CodeHookFn),
    Mem(MemHookFn),
}

impl HookCallback {
    pub fn code<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine, u64, usize) -> Result<()> + 'static,
    {
        HookCallback::Code(Box::new(f))
    }

    pub fn mem<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine, MemAccess) -> Result<()> + 'static,
    {
        HookCallback::Mem(Box::new(f))
    }
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookCallback::Code(_) => f.write_str("HookCallback::Code(..)"),
            HookCallback::Mem(_) => f.write_str("HookCallback::Mem(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Hook {
    pub id: HookId,
    pub hook_type: HookType,
    /// `None` matches every address.
    pub range: Option<Range<u64>>,
    pub enabled: bool,
    callback: HookCallback,
}

impl Hook {
    fn covers(&self, address: u64) -> bool {
        self.enabled
            && self
                .range
                .as_ref()
                .map_or(true, |range| range.contains(&address))
    }
}

/// Registered hooks, dispatched in registration order.
#[derive(Debug)]
pub struct HookManager {
    hooks: Vec<Hook>,
    next_id: HookId,
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add_hook(
        &mut self,
        hook_type: HookType,
        range: Option<Range<u64>>,
        callback: HookCallback,
    ) -> Result<HookId> {
        match (&callback, hook_type) {
            (HookCallback::Code(_), HookType::Code) => {}
            (HookCallback::Mem(_), HookType::MemRead | HookType::MemWrite | HookType::MemAccess) => {}
            _ => {
                return Err(EmulatorError::InvalidArgument(format!(
                    "{callback:?} cannot be registered as a {hook_type:?} hook"
                )));
            }
        }

        if let Some(range) = &range {
            if range.is_empty() {
                return Err(EmulatorError::InvalidArgument(format!(
                    "empty hook range {:#x}..{:#x}",
                    range.start, range.end
                )));
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        debug!(id, ?hook_type, ?range, "hook registered");
        self.hooks.push(Hook {
            id,
            hook_type,
            range,
            enabled: true,
            callback,
        });

        Ok(id)
    }

    pub fn remove_hook(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|hook| hook.id != id);
        let removed = self.hooks.len() != before;
        if removed {
            debug!(id, "hook removed");
        }
        removed
    }

    pub fn set_enabled(&mut self, id: HookId, enabled: bool) -> bool {
        match self.hooks.iter_mut().find(|hook| hook.id == id) {
            Some(hook) => {
                hook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn run_code_hooks(&mut self, machine: &mut Machine, address: u64, size: usize) -> Result<()> {
        for hook in self.hooks.iter_mut().filter(|hook| hook.covers(address)) {
            if let HookCallback::Code(callback) = &mut hook.callback {
                callback(machine, address, size)?;
            }
        }
        Ok(())
    }

    pub fn run_mem_hooks(&mut self, machine: &mut Machine, access: MemAccess) -> Result<()> {
        for hook in self
            .hooks
            .iter_mut()
            .filter(|hook| hook.hook_type.matches(access.kind) && hook.covers(access.address))
        {
            if let HookCallback::Mem(callback) = &mut hook.callback {
                callback(machine, access)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn read_at(address: u64) -> MemAccess {
        MemAccess {
            kind: MemAccessKind::Read,
            address,
            size: 8,
            value: 0,
        }
    }

    #[test]
    fn dispatches_in_registration_order_across_types() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = HookManager::new();

        for (tag, hook_type) in [
            ("access", HookType::MemAccess),
            ("write", HookType::MemWrite),
            ("read", HookType::MemRead),
        ] {
            let log = log.clone();
            hooks
                .add_hook(
                    hook_type,
                    None,
                    HookCallback::mem(move |_, _| {
                        log.borrow_mut().push(tag);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        let mut machine = Machine::new();
        hooks.run_mem_hooks(&mut machine, read_at(0x1000)).unwrap();
        assert_eq!(*log.borrow(), vec!["access", "read"]);
    }

    #[test]
    fn range_filter_and_enable_flag() {
        let hits = Rc::new(RefCell::new(0));
        let mut hooks = HookManager::new();
        let counter = hits.clone();
        let id = hooks
            .add_hook(
                HookType::Code,
                Some(0x1000..0x1010),
                HookCallback::code(move |_, _, _| {
                    *counter.borrow_mut() += 1;
                    Ok(())
                }),
            )
            .unwrap();

        let mut machine = Machine::new();
        hooks.run_code_hooks(&mut machine, 0x1000, 1).unwrap();
        hooks.run_code_hooks(&mut machine, 0x1010, 1).unwrap();
        assert_eq!(*hits.borrow(), 1);

        assert!(hooks.set_enabled(id, false));
        hooks.run_code_hooks(&mut machine, 0x1004, 1).unwrap();
        assert_eq!(*hits.borrow(), 1);

        assert!(hooks.remove_hook(id));
        assert!(!hooks.remove_hook(id));
        assert!(!hooks.set_enabled(id, true));
        assert!(hooks.is_empty());
    }

    #[test]
    fn rejects_mismatched_callbacks_and_empty_ranges() {
        let mut hooks = HookManager::new();
        assert!(matches!(
            hooks.add_hook(HookType::MemRead, None, HookCallback::code(|_, _, _| Ok(()))),
            Err(EmulatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            hooks.add_hook(
                HookType::Code,
                Some(0x2000..0x2000),
                HookCallback::code(|_, _, _| Ok(()))
            ),
            Err(EmulatorError::InvalidArgument(_))
        ));
        assert_eq!(hooks.len(), 0);
    }

    #[test]
    fn hook_error_stops_dispatch() {
        let mut hooks = HookManager::new();
        let reached = Rc::new(RefCell::new(false));
        let flag = reached.clone();

        hooks
            .add_hook(
                HookType::Code,
                None,
                HookCallback::code(|_, address, _| {
                    Err(EmulatorError::HookError(format!("refused {address:#x}")))
                }),
            )
            .unwrap();
        hooks
            .add_hook(
                HookType::Code,
                None,
                HookCallback::code(move |_, _, _| {
                    *flag.borrow_mut() = true;
                    Ok(())
                }),
            )
            .unwrap();

        let mut machine = Machine::new();
        assert_eq!(
            hooks.run_code_hooks(&mut machine, 0x40, 2),
            Err(EmulatorError::HookError("refused 0x40".to_string()))
        );
        assert!(!*reached.borrow());
    }
}
