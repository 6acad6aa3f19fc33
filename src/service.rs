//! Service registration and dispatch.
//!
//! Go's `net/rpc`-style servers reflect over a registered receiver to find
//! eligible methods at runtime. Rust has no such reflection, so eligibility
//! is enforced once, at registration time, by a builder: [`ServiceBuilder`]
//! takes closures directly instead of reflecting over a struct's methods,
//! and type-erases their argument/reply types behind `erased_serde` so the
//! dispatch table (`name -> thunk`) can live in one concurrent map
//! regardless of how many distinct `(Args, Reply)` pairs are registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{OrpcError, Result};

/// A type-erased reply value ready for serialization.
pub type ErasedReply = Box<dyn erased_serde::Serialize + Send>;

type MethodFn =
    Arc<dyn for<'de> Fn(&mut dyn erased_serde::Deserializer<'de>) -> Result<ErasedReply> + Send + Sync>;

/// `(thunk, call_count)` — built once at registration, immutable except for
/// the monotonically increasing call counter.
pub struct MethodDescriptor {
    func: MethodFn,
    call_count: AtomicU64,
}

impl MethodDescriptor {
    /// Number of times this method has been invoked.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

/// `(name, methods)` — built by [`ServiceBuilder`], then registered with a
/// [`ServiceRegistrar`].
pub struct ServiceDescriptor {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Builds a [`ServiceDescriptor`] from plain closures.
///
/// Eligibility rules (mirroring `spec.md` §4.2, enforced here instead of
/// via reflection):
/// 1. The service name must be exported (start with an uppercase letter).
/// 2. Each method name must likewise be exported.
/// 3. A method takes exactly one `Args` value and returns exactly one
///    `Result<Reply, OrpcError>` — the Rust shape of "two params after the
///    receiver, reply taken by pointer, one error return".
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Registers one method. `name` must start with an uppercase letter.
    pub fn method<A, R, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let thunk: MethodFn = Arc::new(move |de: &mut dyn erased_serde::Deserializer<'_>| {
            let args: A = erased_serde::deserialize(de)
                .map_err(|e| OrpcError::Codec(format!("decode args: {e}")))?;
            let reply = f(args)?;
            Ok(Box::new(reply) as ErasedReply)
        });
        self.methods.insert(name, thunk);
        self
    }

    /// Finishes the builder. Fails if the service name or any registered
    /// method name is not exported.
    pub fn build(self) -> Result<ServiceDescriptor> {
        if self.name.is_empty() || !is_exported(&self.name) {
            return Err(OrpcError::Protocol(format!(
                "Orpc server: {} is not a valid service name",
                self.name
            )));
        }
        let mut methods = HashMap::new();
        for (method_name, func) in self.methods {
            if !is_exported(&method_name) {
                return Err(OrpcError::Protocol(format!(
                    "Orpc server: {method_name} is not a valid exported method name"
                )));
            }
            methods.insert(
                method_name,
                MethodDescriptor {
                    func,
                    call_count: AtomicU64::new(0),
                },
            );
        }
        Ok(ServiceDescriptor {
            name: self.name,
            methods,
        })
    }
}

/// A concurrent, insert-if-absent map from service name to
/// [`ServiceDescriptor`] — the Rust analogue of Go's `sync.Map`-backed
/// `Server.serviceMap`.
#[derive(Default)]
pub struct ServiceRegistrar {
    services: DashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistrar {
    pub fn new() -> Self {
        ServiceRegistrar::default()
    }

    /// Registers a service. Fails with [`OrpcError::AlreadyRegistered`] if
    /// a service with the same name is already present.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        match self.services.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(OrpcError::AlreadyRegistered(descriptor.name)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    /// Resolves `"Service.Method"` by splitting on the **last** `.`.
    /// Returns the service and the method name so the caller can decode the
    /// body before invoking (the codec must still be read in order even on
    /// a protocol error).
    pub fn find(&self, service_method: &str) -> Result<(Arc<ServiceDescriptor>, String)> {
        let dot = service_method.rfind('.').ok_or_else(|| {
            OrpcError::Protocol(format!(
                "rpc server: service/method request ill-formed: {service_method}"
            ))
        })?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let svc = self
            .services
            .get(service_name)
            .ok_or_else(|| OrpcError::Protocol(format!("rpc server: service not found: {service_name}")))?
            .clone();
        if !svc.methods.contains_key(method_name) {
            return Err(OrpcError::Protocol(format!(
                "rpc server: method not found: {method_name}"
            )));
        }
        Ok((svc, method_name.to_string()))
    }

    /// Invokes `method_name` on `svc`, incrementing its call counter
    /// regardless of the outcome.
    pub fn call(
        &self,
        svc: &ServiceDescriptor,
        method_name: &str,
        de: &mut dyn erased_serde::Deserializer<'_>,
    ) -> Result<ErasedReply> {
        let method = svc
            .methods
            .get(method_name)
            .expect("caller must have validated method_name via find()");
        method.call_count.fetch_add(1, Ordering::Relaxed);
        (method.func)(de).map_err(|e| match e {
            OrpcError::Invoke(_) => e,
            OrpcError::Codec(_) | OrpcError::Protocol(_) => e,
            other => OrpcError::Invoke(other.to_string()),
        })
    }

    /// `(service, method, call_count)` triples for every registered method —
    /// the data the original's HTML debug page rendered, minus the template.
    pub fn snapshot(&self) -> Vec<(String, String, u64)> {
        let mut out = Vec::new();
        for entry in self.services.iter() {
            let svc = entry.value();
            for (method_name, method) in &svc.methods {
                out.push((svc.name.clone(), method_name.clone(), method.call_count()));
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn foo_service() -> ServiceDescriptor {
        ServiceBuilder::new("Foo")
            .method("Sum", |a: Args| Ok(a.num1 + a.num2))
            .build()
            .unwrap()
    }

    fn call_erased(
        registrar: &ServiceRegistrar,
        svc: &ServiceDescriptor,
        method: &str,
        json: &str,
    ) -> Result<i64> {
        let mut de = serde_json::Deserializer::from_str(json);
        let mut de = <dyn erased_serde::Deserializer>::erase(&mut de);
        let reply = registrar.call(svc, method, &mut de)?;
        let bytes = serde_json::to_vec(&reply).unwrap();
        Ok(serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn register_and_call_sum() {
        let registrar = ServiceRegistrar::new();
        registrar.register(foo_service()).unwrap();
        let (svc, method) = registrar.find("Foo.Sum").unwrap();
        let reply = call_erased(&registrar, &svc, &method, r#"{"num1":3,"num2":4}"#).unwrap();
        assert_eq!(reply, 7);
        assert_eq!(svc.methods.get("Sum").unwrap().call_count(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registrar = ServiceRegistrar::new();
        registrar.register(foo_service()).unwrap();
        let err = registrar.register(foo_service()).unwrap_err();
        assert!(matches!(err, OrpcError::AlreadyRegistered(name) if name == "Foo"));
    }

    #[test]
    fn non_exported_service_name_rejected() {
        let err = ServiceBuilder::new("foo")
            .method("Sum", |a: Args| Ok(a.num1 + a.num2))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrpcError::Protocol(_)));
    }

    #[test]
    fn non_exported_method_name_rejected() {
        let err = ServiceBuilder::new("Foo")
            .method("sum", |a: Args| Ok(a.num1 + a.num2))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrpcError::Protocol(_)));
    }

    #[test]
    fn unknown_method_error_contains_name() {
        let registrar = ServiceRegistrar::new();
        registrar.register(foo_service()).unwrap();
        let err = registrar.find("Foo.Missing").unwrap_err();
        assert!(err.to_string().contains("method not found: Missing"));
    }

    #[test]
    fn missing_dot_is_ill_formed() {
        let registrar = ServiceRegistrar::new();
        let err = registrar.find("FooSum").unwrap_err();
        assert!(err.to_string().contains("ill-formed"));
    }

    #[test]
    fn unknown_service_error_contains_name() {
        let registrar = ServiceRegistrar::new();
        let err = registrar.find("Bar.Sum").unwrap_err();
        assert!(err.to_string().contains("service not found: Bar"));
    }

    #[test]
    fn snapshot_reports_call_counts() {
        let registrar = ServiceRegistrar::new();
        registrar.register(foo_service()).unwrap();
        let (svc, method) = registrar.find("Foo.Sum").unwrap();
        call_erased(&registrar, &svc, &method, r#"{"num1":1,"num2":1}"#).unwrap();
        call_erased(&registrar, &svc, &method, r#"{"num1":2,"num2":2}"#).unwrap();
        let snapshot = registrar.snapshot();
        assert_eq!(snapshot, vec![("Foo".to_string(), "Sum".to_string(), 2)]);
    }
}
