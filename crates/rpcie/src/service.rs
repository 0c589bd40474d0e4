//! Service registration and "reflective" dispatch.
//!
//! Rust has no runtime reflection, so this module follows design notes
//! option (b): every registered service exposes a uniform
//! `dispatch(method, args) -> reply` contract, and a [`ServiceBuilder`] lets
//! callers build that contract out of individually-typed async closures
//! instead of hand-writing the `match` themselves. Argument/reply validation
//! — "is this type built-in or exported" in the Go source — happens at
//! compile time instead of at registration time: a closure simply won't
//! compile unless its argument and reply types satisfy `Serialize`/
//! `DeserializeOwned`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::RpcError;

/// Per-method bookkeeping: the reflective description of one registered
/// method, minus the type handles (the closure already owns those).
#[derive(Debug, Default)]
pub struct MethodType {
    num_calls: AtomicU64,
}

impl MethodType {
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::SeqCst)
    }
}

type BoxedMethod = Box<
    dyn Fn(Value) -> std::pin::Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>
        + Send
        + Sync,
>;

struct Method {
    handler: BoxedMethod,
    info: Arc<MethodType>,
}

/// An invocable service: a name plus a map of eligible methods. Built once
/// via [`ServiceBuilder`] and immutable thereafter.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reflective description of a registered method, for introspection and
    /// tests (`num_calls` in particular — see spec §8's "monotonically
    /// increases" invariant).
    pub fn method_info(&self, method: &str) -> Option<Arc<MethodType>> {
        self.methods.get(method).map(|m| m.info.clone())
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Invokes `method` with `args`, atomically incrementing its call
    /// counter first. A handler panic is trapped and converted to
    /// `RpcError::MethodPanic`, matching the Go source's recovered-panic
    /// error message verbatim.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
        entry.info.num_calls.fetch_add(1, Ordering::SeqCst);

        let future = (entry.handler)(args);
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(RpcError::MethodPanic),
        }
    }
}

/// Builds a [`Service`] out of individually-typed method closures.
///
/// ```
/// use rpcie::service::ServiceBuilder;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone)]
/// struct Foo;
///
/// #[derive(Deserialize)]
/// struct Args { a: i64, b: i64 }
///
/// # async fn build() -> rpcie::service::Service {
/// ServiceBuilder::new("Foo", Foo)
///     .method("Sum", |_receiver: std::sync::Arc<Foo>, args: Args| async move {
///         Ok::<_, rpcie::error::RpcError>(args.a + args.b)
///     })
///     .build()
/// # }
/// ```
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Method>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    pub fn new(name: impl Into<String>, receiver: T) -> Self {
        Self {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// Registers one method. `f` takes the shared receiver and a decoded
    /// `A`, and returns a future resolving to `Result<R, RpcError>` —
    /// the Rust shape of the Go source's
    /// `func (receiver T) Method(args A, reply *R) error`.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let receiver = self.receiver.clone();
        let f = Arc::new(f);
        let handler: BoxedMethod = Box::new(move |raw_args: Value| {
            let receiver = receiver.clone();
            let f = f.clone();
            let args: Result<A, RpcError> =
                serde_json::from_value(raw_args).map_err(|err| RpcError::Decode(err.to_string()));
            let fut = async move {
                let args = args?;
                let reply = f(receiver, args).await?;
                serde_json::to_value(reply).map_err(|err| RpcError::Encode(err.to_string()))
            };
            Box::pin(fut)
        });
        self.methods.insert(
            name.to_string(),
            Method {
                handler,
                info: Arc::new(MethodType::default()),
            },
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}
