// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Hook dispatcher for CRIU notify scripts.
//!
//! CRIU pauses at fixed points of a dump or restore and reports the point
//! by script name. Each name maps to one slot; unset slots acknowledge
//! immediately. A slot runs at most once per operation.

use std::fmt;
use std::os::fd::OwnedFd;
use std::str::FromStr;

use crate::error::HookError;

/// Notify script names CRIU can report, in the order it reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookName {
    PreDump,
    PostDump,
    NetworkLock,
    NetworkUnlock,
    PreRestore,
    SetupNamespaces,
    PostSetupNamespaces,
    OrphanPtsMaster,
    PostRestore,
    PreResume,
    PostResume,
}

impl HookName {
    pub const ALL: [HookName; 11] = [
        Self::PreDump,
        Self::PostDump,
        Self::NetworkLock,
        Self::NetworkUnlock,
        Self::PreRestore,
        Self::SetupNamespaces,
        Self::PostSetupNamespaces,
        Self::OrphanPtsMaster,
        Self::PostRestore,
        Self::PreResume,
        Self::PostResume,
    ];

    /// Script name as sent on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreDump => "pre-dump",
            Self::PostDump => "post-dump",
            Self::NetworkLock => "network-lock",
            Self::NetworkUnlock => "network-unlock",
            Self::PreRestore => "pre-restore",
            Self::SetupNamespaces => "setup-namespaces",
            Self::PostSetupNamespaces => "post-setup-namespaces",
            Self::OrphanPtsMaster => "orphan-pts-master",
            Self::PostRestore => "post-restore",
            Self::PreResume => "pre-resume",
            Self::PostResume => "post-resume",
        }
    }

    /// Look up a wire name. Unknown names yield None.
    pub fn from_script(script: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.as_str() == script)
    }

    const fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookName {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_script(s).ok_or_else(|| HookError::UnknownHook {
            name: s.to_string(),
        })
    }
}

/// What CRIU told us alongside a notification.
#[derive(Debug)]
pub struct HookContext {
    pub name: HookName,
    /// Pid of the task being restored, when CRIU reports one.
    pub pid: Option<i32>,
    /// Descriptor passed with the notification (orphan-pts-master only).
    pub fd: Option<OwnedFd>,
}

/// Callback bound to a hook slot.
pub type HookFn = Box<dyn FnMut(&mut HookContext) -> Result<(), HookError> + Send>;

/// Outcome of dispatching one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A registered callback ran and succeeded.
    Ran,
    /// Slot unset, already fired, or the script name is unknown.
    Skipped,
}

/// Ordered set of hook slots owned by one operation.
pub struct HookSet {
    slots: [Option<HookFn>; 11],
    fired: [bool; 11],
}

impl HookSet {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            fired: [false; 11],
        }
    }

    /// Bind a callback to a slot, replacing any previous one.
    pub fn on<F>(&mut self, name: HookName, hook: F) -> &mut Self
    where
        F: FnMut(&mut HookContext) -> Result<(), HookError> + Send + 'static,
    {
        self.slots[name.slot()] = Some(Box::new(hook));
        self
    }

    /// Bind a callback by wire name. Unknown names are rejected here rather
    /// than silently never firing.
    pub fn register<F>(&mut self, name: &str, hook: F) -> Result<&mut Self, HookError>
    where
        F: FnMut(&mut HookContext) -> Result<(), HookError> + Send + 'static,
    {
        let name: HookName = name.parse()?;
        Ok(self.on(name, hook))
    }

    pub fn is_set(&self, name: HookName) -> bool {
        self.slots[name.slot()].is_some()
    }

    /// True when no slot is bound; CRIU then need not send notifications.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Names of bound slots in notification order.
    pub fn registered(&self) -> Vec<HookName> {
        HookName::ALL
            .into_iter()
            .filter(|name| self.is_set(*name))
            .collect()
    }

    /// Run the slot for a notification.
    pub fn dispatch(
        &mut self,
        script: &str,
        pid: Option<i32>,
        fd: Option<OwnedFd>,
    ) -> Result<Dispatch, HookError> {
        let Some(name) = HookName::from_script(script) else {
            tracing::debug!(script = script, "Ignoring unknown CRIU notification");
            return Ok(Dispatch::Skipped);
        };

        if self.fired[name.slot()] {
            tracing::debug!(hook = %name, "Hook already fired for this operation");
            return Ok(Dispatch::Skipped);
        }
        self.fired[name.slot()] = true;

        let Some(hook) = self.slots[name.slot()].as_mut() else {
            return Ok(Dispatch::Skipped);
        };

        if name == HookName::OrphanPtsMaster && fd.is_none() {
            return Err(HookError::MissingDescriptor {
                hook: name.as_str(),
            });
        }

        let mut ctx = HookContext { name, pid, fd };
        tracing::debug!(hook = %name, pid = ?pid, "Running hook");
        hook(&mut ctx)?;
        Ok(Dispatch::Ran)
    }
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("registered", &self.registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_names_round_trip_wire_strings() {
        for name in HookName::ALL {
            assert_eq!(HookName::from_script(name.as_str()), Some(name));
        }
        assert_eq!(HookName::from_script("pre-stream"), None);
    }

    #[test]
    fn test_register_rejects_unknown_name() {
        let mut hooks = HookSet::new();
        let err = hooks.register("pre-checkpoint", |_| Ok(())).unwrap_err();
        assert!(matches!(err, HookError::UnknownHook { .. }));
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_unset_slot_is_noop() {
        let mut hooks = HookSet::new();
        assert_eq!(
            hooks.dispatch("pre-dump", None, None).unwrap(),
            Dispatch::Skipped
        );
        assert_eq!(
            hooks.dispatch("not-a-hook", None, None).unwrap(),
            Dispatch::Skipped
        );
    }

    #[test]
    fn test_slot_fires_at_most_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookSet::new();
        let c = Arc::clone(&count);
        hooks.on(HookName::PreResume, move |ctx| {
            assert_eq!(ctx.pid, Some(321));
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(
            hooks.dispatch("pre-resume", Some(321), None).unwrap(),
            Dispatch::Ran
        );
        assert_eq!(
            hooks.dispatch("pre-resume", Some(321), None).unwrap(),
            Dispatch::Skipped
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_error_propagates() {
        let mut hooks = HookSet::new();
        hooks
            .register("network-lock", |_| {
                Err(HookError::Callback("iptables unavailable".to_string()))
            })
            .unwrap();

        let err = hooks.dispatch("network-lock", None, None).unwrap_err();
        assert!(err.to_string().contains("iptables"));
    }

    #[test]
    fn test_orphan_pts_master_requires_fd() {
        let mut hooks = HookSet::new();
        hooks.on(HookName::OrphanPtsMaster, |_| Ok(()));
        assert!(matches!(
            hooks.dispatch("orphan-pts-master", None, None),
            Err(HookError::MissingDescriptor { .. })
        ));
    }

    #[test]
    fn test_registered_in_notification_order() {
        let mut hooks = HookSet::new();
        hooks.on(HookName::PostResume, |_| Ok(()));
        hooks.on(HookName::PreDump, |_| Ok(()));
        assert_eq!(
            hooks.registered(),
            vec![HookName::PreDump, HookName::PostResume]
        );
    }
}
