//! Dynamic module loading, mirroring xmp3's `xmp3_module.h` ABI: each
//! shared object exports one well-known symbol holding a small table of
//! function pointers (`new`/`del`/`conf`/`start`/`stop`) that the host
//! calls at the appropriate points in the server lifecycle.

use std::ffi::{CString, c_char, c_void};
use std::path::Path;

use anyhow::{Context, Error, anyhow};
use libloading::{Library, Symbol};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use confidante_core::xmpp::jid::{Jid, JidPattern};
use confidante_core::xmpp::stanza::Stanza;

use crate::router::RouterHandle;

/// Name of the exported symbol each module shared object must define,
/// analogous to xmp3's `XMP3_MODULE` global.
const MODULE_SYMBOL: &[u8] = b"CONFIDANTE_MODULE\0";

pub type ModuleNewFn = unsafe extern "C" fn() -> *mut c_void;
pub type ModuleDelFn = unsafe extern "C" fn(*mut c_void);
pub type ModuleConfFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> bool;
pub type ModuleStartFn = unsafe extern "C" fn(*mut c_void, *const ServerApi) -> bool;
pub type ModuleStopFn = unsafe extern "C" fn(*mut c_void) -> bool;

/// The function-pointer table a module shared object must export.
#[repr(C)]
pub struct ModuleDescriptor {
    pub module_new: ModuleNewFn,
    pub module_del: ModuleDelFn,
    pub module_conf: ModuleConfFn,
    pub module_start: ModuleStartFn,
    pub module_stop: ModuleStopFn,
}

/// Handed to a module's `start` callback. Exposes the only way a module
/// can reach into the core: registering stanza/IQ routes and listening
/// for client disconnects. Calls block the calling (module) thread on
/// the async router, since the C ABI offers modules no notion of
/// futures.
///
/// A module written in another language would reach these through a
/// thin `extern "C"` shim (`server_api_add_stanza_route` and friends,
/// each taking the `ServerApi` pointer plus plain-old-data arguments);
/// the in-process MUC component built against this crate calls the
/// safe methods directly.
pub struct ServerApi {
    router: RouterHandle,
    runtime: Handle,
}

impl ServerApi {
    fn new(router: RouterHandle, runtime: Handle) -> Self {
        ServerApi { router, runtime }
    }

    /// `server_api_add_stanza_route` — registers a stanza route matching
    /// `pattern`, delivering matched stanzas to `handler`. The xmp3
    /// module ABI has no call to remove a route again, so the route
    /// outlives the module.
    pub fn add_stanza_route(&self, pattern: JidPattern, handler: mpsc::Sender<Stanza>) {
        let router = self.router.clone();
        let result = self
            .runtime
            .block_on(async move { router.add_stanza_route(pattern, handler).await });
        if let Err(err) = result {
            tracing::warn!(%err, "module failed to register stanza route");
        }
    }

    /// `server_api_add_iq_route` — registers a handler for IQ get/set
    /// stanzas whose single payload child matches `name`.
    pub fn add_iq_route(&self, name: (String, Option<String>), handler: mpsc::Sender<Stanza>) {
        let router = self.router.clone();
        if let Err(err) = self
            .runtime
            .block_on(async move { router.add_iq_route(name, handler).await })
        {
            tracing::warn!(%err, "module failed to register iq route");
        }
    }

    /// `server_api_add_client_listener` — registers a listener notified
    /// with the bare JID of every entity that disconnects.
    pub fn add_client_listener(&self, listener: mpsc::Sender<Jid>) {
        let router = self.router.clone();
        if let Err(err) = self
            .runtime
            .block_on(async move { router.add_disconnect_listener(listener).await })
        {
            tracing::warn!(%err, "module failed to register disconnect listener");
        }
    }
}

struct LoadedModule {
    name: String,
    // Kept alive for the lifetime of the loaded module; dropping it
    // unmaps the shared object, so it must outlive `instance`.
    _library: Library,
    descriptor: *const ModuleDescriptor,
    instance: *mut c_void,
}

// SAFETY: modules are only ever driven from the single-threaded
// registry; the registry itself is moved, never shared, across threads.
unsafe impl Send for LoadedModule {}

/// Owns every dynamically loaded extension module for the lifetime of
/// the server.
pub struct ModuleRegistry {
    modules: Vec<LoadedModule>,
    router: RouterHandle,
    runtime: Handle,
}

impl ModuleRegistry {
    pub fn new(router: RouterHandle, runtime: Handle) -> Self {
        ModuleRegistry {
            modules: Vec::new(),
            router,
            runtime,
        }
    }

    /// Loads the shared object at `path` and instantiates it, without
    /// starting it yet. `name` is used only for logging and diagnostics.
    ///
    /// # Safety
    ///
    /// The shared object at `path` must export a `CONFIDANTE_MODULE`
    /// symbol of type `ModuleDescriptor` whose function pointers are
    /// valid for the lifetime of the loaded library.
    pub unsafe fn load(&mut self, name: &str, path: &Path) -> Result<(), Error> {
        let library = unsafe {
            Library::new(path).with_context(|| format!("loading module library {}", path.display()))?
        };

        let descriptor: *const ModuleDescriptor = unsafe {
            let symbol: Symbol<*const ModuleDescriptor> = library
                .get(MODULE_SYMBOL)
                .with_context(|| format!("module {name} does not export CONFIDANTE_MODULE"))?;
            *symbol
        };

        let instance = unsafe { ((*descriptor).module_new)() };
        if instance.is_null() {
            return Err(anyhow!("module {name} failed to instantiate"));
        }

        self.modules.push(LoadedModule {
            name: name.to_string(),
            _library: library,
            descriptor,
            instance,
        });
        Ok(())
    }

    /// Feeds one `key = value` configuration line to the named module.
    pub fn configure(&self, name: &str, key: &str, value: &str) -> Result<(), Error> {
        let module = self
            .modules
            .iter()
            .find(|module| module.name == name)
            .ok_or_else(|| anyhow!("no such module: {name}"))?;

        let key = CString::new(key)?;
        let value = CString::new(value)?;
        let ok = unsafe {
            ((*module.descriptor).module_conf)(module.instance, key.as_ptr(), value.as_ptr())
        };
        if ok {
            Ok(())
        } else {
            Err(anyhow!("module {name} rejected configuration key {key:?}", key = key))
        }
    }

    /// Starts every loaded module, handing each a `ServerApi` it can use
    /// to register routes with the router.
    pub fn start_all(&self) -> Result<(), Error> {
        for module in &self.modules {
            let api = ServerApi::new(self.router.clone(), self.runtime.clone());
            let ok = unsafe { ((*module.descriptor).module_start)(module.instance, &api) };
            if !ok {
                return Err(anyhow!("module {} failed to start", module.name));
            }
            tracing::info!(module = %module.name, "module started");
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for module in self.modules.iter().rev() {
            let ok = unsafe { ((*module.descriptor).module_stop)(module.instance) };
            if !ok {
                tracing::warn!(module = %module.name, "module failed to stop cleanly");
            }
        }
    }
}

impl Drop for ModuleRegistry {
    fn drop(&mut self) {
        // Unload in reverse load order, mirroring stop_all: a module may
        // depend on one loaded before it.
        while let Some(module) = self.modules.pop() {
            unsafe { ((*module.descriptor).module_del)(module.instance) };
        }
    }
}
