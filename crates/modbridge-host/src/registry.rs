//! Route registry bridge between modules and the HTTP dispatch table.
//!
//! Every registration is owned by the identity of the module that created
//! it. Replacing a slot the same module owns is atomic with respect to
//! concurrent dispatch: a lookup clones one `Arc` holding both the handler
//! and its extra pointer, so a reader can never observe a handler paired
//! with another registration's extra. Unregistration and sweep only ever
//! touch slots owned by the acting identity.

use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_void;
use std::sync::Arc;

use parking_lot::RwLock;

use modbridge_abi::{method, HostContext, HostRequest, HttpHandlerFn};

use crate::error::RouteError;
use crate::muid::Muid;

/// Number of verb slots per path (bit 0 of the mask is reserved).
const METHOD_SLOTS: usize = 7;

/// Bit set over HTTP verbs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MethodMask(u8);

impl MethodMask {
    pub const GET: MethodMask = MethodMask(method::METHOD_GET);
    pub const HEAD: MethodMask = MethodMask(method::METHOD_HEAD);
    pub const POST: MethodMask = MethodMask(method::METHOD_POST);
    pub const PUT: MethodMask = MethodMask(method::METHOD_PUT);
    pub const DELETE: MethodMask = MethodMask(method::METHOD_DELETE);
    pub const PATCH: MethodMask = MethodMask(method::METHOD_PATCH);
    pub const OPTIONS: MethodMask = MethodMask(method::METHOD_OPTIONS);
    /// Matches every valid verb bit.
    pub const ANY: MethodMask = MethodMask(method::METHOD_ANY);

    const VALID: u8 = method::METHOD_GET
        | method::METHOD_HEAD
        | method::METHOD_POST
        | method::METHOD_PUT
        | method::METHOD_DELETE
        | method::METHOD_PATCH
        | method::METHOD_OPTIONS;

    pub const fn from_bits(bits: u8) -> Self {
        MethodMask(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when no valid verb bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 & Self::VALID == 0
    }

    pub const fn contains(self, other: MethodMask) -> bool {
        let wanted = other.0 & Self::VALID;
        self.0 & wanted == wanted && wanted != 0
    }

    /// Verb slot indices (0..7) selected by this mask.
    fn slots(self) -> impl Iterator<Item = usize> {
        let bits = self.0 & Self::VALID;
        (0..METHOD_SLOTS).filter(move |i| bits & (1 << (i + 1)) != 0)
    }
}

impl fmt::Debug for MethodMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodMask({:#010b})", self.0)
    }
}

impl fmt::Display for MethodMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Self::ANY) {
            return f.write_str("ANY");
        }
        let names = ["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"];
        let mut first = true;
        for slot in self.slots() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(names[slot])?;
            first = false;
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// One live (handler, extra) pair plus its owning identity.
pub struct RouteBinding {
    owner: Muid,
    handler: HttpHandlerFn,
    extra: *mut c_void,
}

// `extra` is an opaque token supplied by the owning module; the host never
// dereferences it, only passes it back on invocation.
unsafe impl Send for RouteBinding {}
unsafe impl Sync for RouteBinding {}

impl RouteBinding {
    pub fn owner(&self) -> Muid {
        self.owner
    }

    pub fn extra(&self) -> *mut c_void {
        self.extra
    }

    /// Address of the handler function, for identity comparisons.
    pub fn handler_addr(&self) -> usize {
        self.handler as usize
    }

    /// Invoke the module's handler with a request context.
    ///
    /// # Safety
    ///
    /// The owning module must still be loaded; the dispatch engine must not
    /// invoke bindings after the owning identity has been swept.
    pub unsafe fn invoke(&self, ctx: *mut HostContext, req: *mut HostRequest) {
        (self.handler)(ctx, req, self.extra)
    }
}

#[derive(Default)]
struct RouteEntry {
    slots: [Option<Arc<RouteBinding>>; METHOD_SLOTS],
    /// Entry also matches any longer path sharing this prefix.
    wildcard: bool,
}

impl RouteEntry {
    fn is_vacant(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// The host's HTTP dispatch table, keyed by (path, verb slot).
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, RouteEntry>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler`/`extra` for every verb in `mask` under `path`.
    ///
    /// Re-registering a slot the same identity already owns replaces the
    /// binding; a slot owned by a different identity fails with
    /// [`RouteError::NotOwner`] and nothing is modified. A path ending in
    /// `*` registers a prefix match.
    pub fn register(
        &self,
        owner: Muid,
        mask: MethodMask,
        path: &str,
        handler: HttpHandlerFn,
        extra: *mut c_void,
    ) -> Result<(), RouteError> {
        if mask.is_empty() {
            return Err(RouteError::InvalidMask);
        }
        let (key, wildcard) = normalize(path);
        let binding = Arc::new(RouteBinding {
            owner,
            handler,
            extra,
        });

        let mut routes = self.routes.write();
        let entry = routes.entry(key.clone()).or_default();
        for slot in mask.slots() {
            if let Some(existing) = &entry.slots[slot] {
                if existing.owner != owner {
                    tracing::warn!(
                        path = %key,
                        owner = %existing.owner,
                        caller = %owner,
                        "refusing to overwrite a route owned by another module"
                    );
                    return Err(RouteError::NotOwner {
                        path: key,
                        owner: existing.owner,
                    });
                }
            }
        }
        for slot in mask.slots() {
            entry.slots[slot] = Some(binding.clone());
        }
        if wildcard {
            entry.wildcard = true;
        }
        tracing::info!(path = %key, mask = %mask, muid = %owner, "added HTTP handler");
        Ok(())
    }

    /// Remove the caller's bindings for every verb in `mask` under `path`.
    ///
    /// Slots owned by another identity fail the whole call with
    /// [`RouteError::NotOwner`], leaving every route untouched; a mask that
    /// selects no occupied slot yields [`RouteError::NotFound`].
    pub fn unregister(
        &self,
        owner: Muid,
        mask: MethodMask,
        path: &str,
    ) -> Result<usize, RouteError> {
        if mask.is_empty() {
            return Err(RouteError::InvalidMask);
        }
        let (key, _) = normalize(path);

        let mut routes = self.routes.write();
        let entry = routes
            .get_mut(&key)
            .ok_or_else(|| RouteError::NotFound { path: key.clone() })?;

        let mut owned = 0usize;
        for slot in mask.slots() {
            if let Some(existing) = &entry.slots[slot] {
                if existing.owner != owner {
                    return Err(RouteError::NotOwner {
                        path: key,
                        owner: existing.owner,
                    });
                }
                owned += 1;
            }
        }
        if owned == 0 {
            return Err(RouteError::NotFound { path: key });
        }
        for slot in mask.slots() {
            entry.slots[slot] = None;
        }
        if entry.is_vacant() {
            routes.remove(&key);
        }
        tracing::info!(path = %key, mask = %mask, muid = %owner, "unregistered HTTP handler");
        Ok(owned)
    }

    /// Look up the binding dispatching `verb` on `path`.
    ///
    /// Exact match wins; otherwise the longest wildcard prefix entry with
    /// that verb slot populated is returned.
    pub fn lookup(&self, path: &str, verb: MethodMask) -> Option<Arc<RouteBinding>> {
        let slot = verb.slots().next()?;
        let (key, _) = normalize(path);

        let routes = self.routes.read();
        if let Some(entry) = routes.get(&key) {
            if let Some(binding) = &entry.slots[slot] {
                return Some(binding.clone());
            }
        }
        routes
            .iter()
            .filter(|(prefix, entry)| entry.wildcard && key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, entry)| entry.slots[slot].clone())
    }

    /// Remove every binding owned by `owner`; returns how many slots were
    /// cleared. Called on unload so no route can point into unloaded code.
    pub fn sweep(&self, owner: Muid) -> usize {
        let mut routes = self.routes.write();
        let mut cleared = 0usize;
        routes.retain(|_, entry| {
            for slot in entry.slots.iter_mut() {
                if slot.as_ref().is_some_and(|b| b.owner == owner) {
                    *slot = None;
                    cleared += 1;
                }
            }
            !entry.is_vacant()
        });
        if cleared > 0 {
            tracing::debug!(muid = %owner, cleared, "swept module routes");
        }
        cleared
    }

    /// Number of slots currently owned by `owner`.
    pub fn count_owned(&self, owner: Muid) -> usize {
        self.routes
            .read()
            .values()
            .flat_map(|entry| entry.slots.iter())
            .filter(|slot| slot.as_ref().is_some_and(|b| b.owner == owner))
            .count()
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a route path to its registry key. Returns the key and whether
/// the path was a wildcard (`…*`) registration. Wildcard keys keep a
/// trailing `/` so `/api*` matches `/api/v1` but never `/apiary`.
fn normalize(path: &str) -> (String, bool) {
    let mut p = path.to_string();
    let mut wildcard = false;
    if let Some(stripped) = p.strip_suffix('*') {
        wildcard = true;
        p = stripped.to_string();
        if !p.ends_with('/') {
            p.push('/');
        }
    }
    if p.is_empty() {
        p = "/".to_string();
    }
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    (p, wildcard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::c_void;
    use std::sync::atomic::{AtomicBool, Ordering};

    unsafe extern "C" fn handler_a(
        _ctx: *mut HostContext,
        _req: *mut HostRequest,
        _extra: *mut c_void,
    ) {
    }

    unsafe extern "C" fn handler_b(
        _ctx: *mut HostContext,
        _req: *mut HostRequest,
        _extra: *mut c_void,
    ) {
    }

    fn muid(n: u64) -> Muid {
        Muid::from_raw(n)
    }

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize(""), ("/".into(), false));
        assert_eq!(normalize("a"), ("/a".into(), false));
        assert_eq!(normalize("/a"), ("/a".into(), false));
        assert_eq!(normalize("/api/*"), ("/api/".into(), true));
        assert_eq!(normalize("/api*"), ("/api/".into(), true));
    }

    #[test]
    fn register_and_lookup() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::GET, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        let hit = reg.lookup("/a", MethodMask::GET).unwrap();
        assert_eq!(hit.owner(), muid(1));
        assert_eq!(hit.handler_addr(), handler_a as usize);
        assert!(reg.lookup("/a", MethodMask::POST).is_none());
        assert!(reg.lookup("/b", MethodMask::GET).is_none());
    }

    #[test]
    fn reregistration_replaces_binding() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::GET, "/a", handler_a, 1usize as *mut c_void)
            .unwrap();
        reg.register(muid(1), MethodMask::GET, "/a", handler_b, 2usize as *mut c_void)
            .unwrap();
        assert_eq!(reg.len(), 1);
        let hit = reg.lookup("/a", MethodMask::GET).unwrap();
        assert_eq!(hit.handler_addr(), handler_b as usize);
        assert_eq!(hit.extra() as usize, 2);
    }

    #[test]
    fn register_over_foreign_slot_is_refused() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::GET, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        let err = reg
            .register(muid(2), MethodMask::GET, "/a", handler_b, std::ptr::null_mut())
            .unwrap_err();
        assert!(matches!(err, RouteError::NotOwner { owner, .. } if owner == muid(1)));
        let hit = reg.lookup("/a", MethodMask::GET).unwrap();
        assert_eq!(hit.handler_addr(), handler_a as usize);
    }

    #[test]
    fn unregister_requires_ownership() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::GET, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        let err = reg.unregister(muid(2), MethodMask::GET, "/a").unwrap_err();
        assert!(matches!(err, RouteError::NotOwner { .. }));
        // Route is untouched.
        assert!(reg.lookup("/a", MethodMask::GET).is_some());

        reg.unregister(muid(1), MethodMask::GET, "/a").unwrap();
        assert!(reg.lookup("/a", MethodMask::GET).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn unregister_missing_is_not_found() {
        let reg = RouteRegistry::new();
        let err = reg.unregister(muid(1), MethodMask::GET, "/a").unwrap_err();
        assert!(matches!(err, RouteError::NotFound { .. }));
    }

    #[test]
    fn empty_mask_is_invalid() {
        let reg = RouteRegistry::new();
        let err = reg
            .register(
                muid(1),
                MethodMask::from_bits(0b1), // reserved bit only
                "/a",
                handler_a,
                std::ptr::null_mut(),
            )
            .unwrap_err();
        assert!(matches!(err, RouteError::InvalidMask));
    }

    #[test]
    fn any_mask_matches_every_verb() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::ANY, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        for verb in [
            MethodMask::GET,
            MethodMask::HEAD,
            MethodMask::POST,
            MethodMask::PUT,
            MethodMask::DELETE,
            MethodMask::PATCH,
            MethodMask::OPTIONS,
        ] {
            assert!(reg.lookup("/a", verb).is_some(), "verb {verb} must match");
        }
    }

    #[test]
    fn verbs_outside_mask_never_match() {
        let reg = RouteRegistry::new();
        let mask = MethodMask::from_bits(MethodMask::GET.bits() | MethodMask::HEAD.bits());
        reg.register(muid(1), mask, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        assert!(reg.lookup("/a", MethodMask::GET).is_some());
        assert!(reg.lookup("/a", MethodMask::HEAD).is_some());
        assert!(reg.lookup("/a", MethodMask::DELETE).is_none());
    }

    #[test]
    fn modules_coexist_on_one_path() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::GET, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        reg.register(muid(2), MethodMask::POST, "/a", handler_b, std::ptr::null_mut())
            .unwrap();

        assert_eq!(reg.sweep(muid(1)), 1);
        assert!(reg.lookup("/a", MethodMask::GET).is_none());
        let hit = reg.lookup("/a", MethodMask::POST).unwrap();
        assert_eq!(hit.owner(), muid(2));
    }

    #[test]
    fn sweep_removes_everything_owned() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::ANY, "/a", handler_a, std::ptr::null_mut())
            .unwrap();
        reg.register(muid(1), MethodMask::GET, "/b", handler_a, std::ptr::null_mut())
            .unwrap();
        assert_eq!(reg.count_owned(muid(1)), 8);
        assert_eq!(reg.sweep(muid(1)), 8);
        assert_eq!(reg.count_owned(muid(1)), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn wildcard_prefix_lookup() {
        let reg = RouteRegistry::new();
        reg.register(muid(1), MethodMask::GET, "/api/*", handler_a, std::ptr::null_mut())
            .unwrap();
        reg.register(muid(1), MethodMask::GET, "/api/v2/*", handler_b, std::ptr::null_mut())
            .unwrap();

        let hit = reg.lookup("/api/v1/items", MethodMask::GET).unwrap();
        assert_eq!(hit.handler_addr(), handler_a as usize);
        // Longest prefix wins.
        let hit = reg.lookup("/api/v2/items", MethodMask::GET).unwrap();
        assert_eq!(hit.handler_addr(), handler_b as usize);
        assert!(reg.lookup("/other", MethodMask::GET).is_none());
    }

    #[test]
    fn replacement_is_never_torn() {
        let reg = Arc::new(RouteRegistry::new());
        reg.register(muid(1), MethodMask::GET, "/hot", handler_a, 1usize as *mut c_void)
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let reg = reg.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    let (h, extra): (HttpHandlerFn, usize) = if flip {
                        (handler_a, 1)
                    } else {
                        (handler_b, 2)
                    };
                    reg.register(muid(1), MethodMask::GET, "/hot", h, extra as *mut c_void)
                        .unwrap();
                    flip = !flip;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let hit = reg.lookup("/hot", MethodMask::GET).unwrap();
                        let expected = if hit.handler_addr() == handler_a as usize {
                            1
                        } else {
                            2
                        };
                        assert_eq!(hit.extra() as usize, expected, "torn handler/extra pair");
                    }
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
