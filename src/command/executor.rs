//! Command executors and the executor registry

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use super::registry::{tag_of, Command};
use crate::error::{CommandError, ExecutorError};

/// Processes commands of one type tag
///
/// Executors are shared between concurrent callers and must not assume
/// exclusive access; one that is not reentrant serializes internally.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// The command shape this executor accepts
    type Command: Command;

    /// Value produced on success
    type Output: Serialize + Send;

    async fn execute(&self, command: Self::Command) -> Result<Self::Output, ExecutorError>;

    /// Tag this executor is bound to
    fn command_type(&self) -> &'static str {
        <Self::Command as Command>::TYPE
    }
}

/// Processes commands of any type tag that has no typed executor
///
/// The command arrives as its raw decoded body.
#[async_trait]
pub trait FallbackExecutor: Send + Sync + 'static {
    async fn execute(&self, type_tag: &str, body: Value) -> Result<Value, ExecutorError>;
}

/// Type-erased executor stored in the registry
#[async_trait]
trait DynExecutor: Send + Sync {
    fn command_type(&self) -> &'static str;

    fn executor_name(&self) -> &'static str;

    async fn execute_dyn(&self, command: Box<dyn Any + Send>) -> Result<Value, CommandError>;
}

struct TypedExecutor<E>(E);

#[async_trait]
impl<E: CommandExecutor> DynExecutor for TypedExecutor<E> {
    fn command_type(&self) -> &'static str {
        self.0.command_type()
    }

    fn executor_name(&self) -> &'static str {
        type_name::<E>()
    }

    async fn execute_dyn(&self, command: Box<dyn Any + Send>) -> Result<Value, CommandError> {
        let command = command.downcast::<E::Command>().map_err(|_| {
            CommandError::Codec(format!(
                "command for `{}` is not a {}",
                self.command_type(),
                type_name::<E::Command>()
            ))
        })?;

        let output = match AssertUnwindSafe(self.0.execute(*command)).catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("Command `{}` execution error: {}", self.command_type(), e);
                return Err(CommandError::Executor(e.message));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Command `{}` executor panicked: {}", self.command_type(), message);
                return Err(CommandError::Executor(message));
            }
        };

        Ok(serde_json::to_value(output)?)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}

/// Handle to a local executor
#[derive(Clone)]
pub struct LocalExecutor {
    inner: Arc<dyn DynExecutor>,
}

impl LocalExecutor {
    fn new<E: CommandExecutor>(executor: E) -> Self {
        Self {
            inner: Arc::new(TypedExecutor(executor)),
        }
    }

    pub fn command_type(&self) -> &'static str {
        self.inner.command_type()
    }

    /// Run the executor on the calling task
    ///
    /// `command` must be the executor's command type; executor failures and
    /// panics come back as `CommandError::Executor`.
    pub async fn execute(&self, command: Box<dyn Any + Send>) -> Result<Value, CommandError> {
        self.inner.execute_dyn(command).await
    }
}

impl fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("command_type", &self.inner.command_type())
            .field("executor", &self.inner.executor_name())
            .finish()
    }
}

/// Handle to the catch-all executor
#[derive(Clone)]
pub struct FallbackHandle {
    inner: Arc<dyn FallbackExecutor>,
    name: &'static str,
}

impl FallbackHandle {
    /// Run the catch-all executor for a command tagged `type_tag`
    pub async fn execute(&self, type_tag: &str, body: Value) -> Result<Value, CommandError> {
        match AssertUnwindSafe(self.inner.execute(type_tag, body)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!("Command `{}` fallback execution error: {}", type_tag, e);
                Err(CommandError::Executor(e.message))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Command `{}` fallback executor panicked: {}", type_tag, message);
                Err(CommandError::Executor(message))
            }
        }
    }
}

impl fmt::Debug for FallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackHandle")
            .field("executor", &self.name)
            .finish()
    }
}

/// What a type tag is bound to
#[derive(Debug, Clone)]
pub enum ExecutorBinding {
    /// Processed in this process
    Local(LocalExecutor),
    /// Stand-in that forwards to another application
    Remote { target_app: String },
}

/// What happens when a tag that already has a binding is bound again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingPolicy {
    /// Last registration wins
    #[default]
    Replace,
    /// Keep the first binding and fail the new one
    Reject,
}

/// Maps type tags to at most one executor binding each
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    bindings: RwLock<HashMap<String, ExecutorBinding>>,
    fallback: RwLock<Option<FallbackHandle>>,
    policy: BindingPolicy,
}

impl ExecutorRegistry {
    pub fn new(policy: BindingPolicy) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
            policy,
        }
    }

    pub fn policy(&self) -> BindingPolicy {
        self.policy
    }

    /// Bind a local executor under the tag it declares
    pub fn add_executor<E: CommandExecutor>(&self, executor: E) -> Result<(), CommandError> {
        let tag = tag_of::<E::Command>()?;
        let executor = LocalExecutor::new(executor);
        info!("Executor {} bound to `{}`", executor.inner.executor_name(), tag);
        self.bind(tag, ExecutorBinding::Local(executor))
    }

    /// Bind `C` to a remote application
    pub fn add_remote<C: Command>(&self, target_app: impl Into<String>) -> Result<(), CommandError> {
        let tag = tag_of::<C>()?;
        let target_app = target_app.into();
        info!("Command `{}` delegated to app `{}`", tag, target_app);
        self.bind(tag, ExecutorBinding::Remote { target_app })
    }

    /// Bind the executor used for tags without a typed binding
    pub fn set_fallback<F: FallbackExecutor>(&self, executor: F) -> Result<(), CommandError> {
        let handle = FallbackHandle {
            inner: Arc::new(executor),
            name: type_name::<F>(),
        };
        let mut fallback = self.fallback.write();
        if fallback.is_some() {
            match self.policy {
                BindingPolicy::Reject => {
                    return Err(CommandError::ExecutorAlreadyBound("*".to_string()));
                }
                BindingPolicy::Replace => debug!("Replacing fallback executor"),
            }
        }
        info!("Fallback executor {} bound", handle.name);
        *fallback = Some(handle);
        Ok(())
    }

    pub fn fallback(&self) -> Option<FallbackHandle> {
        self.fallback.read().clone()
    }

    fn bind(&self, tag: &str, binding: ExecutorBinding) -> Result<(), CommandError> {
        let mut bindings = self.bindings.write();
        if bindings.contains_key(tag) {
            match self.policy {
                BindingPolicy::Reject => {
                    return Err(CommandError::ExecutorAlreadyBound(tag.to_string()));
                }
                BindingPolicy::Replace => {
                    debug!("Replacing executor binding for `{}`", tag);
                }
            }
        }
        bindings.insert(tag.to_string(), binding);
        Ok(())
    }

    pub fn lookup(&self, tag: &str) -> Option<ExecutorBinding> {
        self.bindings.read().get(tag).cloned()
    }

    /// Local executor for `tag`, ignoring remote bindings
    pub fn local(&self, tag: &str) -> Option<LocalExecutor> {
        match self.lookup(tag)? {
            ExecutorBinding::Local(executor) => Some(executor),
            ExecutorBinding::Remote { .. } => None,
        }
    }

    pub fn remove(&self, tag: &str) -> Option<ExecutorBinding> {
        self.bindings.write().remove(tag)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddElement {
        element: String,
    }

    impl Command for AddElement {
        const TYPE: &'static str = "add_new_element";
    }

    #[derive(Debug, Serialize)]
    struct AddResult {
        value: String,
    }

    struct AddElementExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandExecutor for AddElementExecutor {
        type Command = AddElement;
        type Output = AddResult;

        async fn execute(&self, command: AddElement) -> Result<AddResult, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if command.element == "EX_TEST" {
                return Err(ExecutorError::new("EX_TEST TEST MSG"));
            }
            if command.element == "PANIC" {
                panic!("executor blew up");
            }
            Ok(AddResult {
                value: command.element,
            })
        }
    }

    struct OtherExecutor;

    #[async_trait]
    impl CommandExecutor for OtherExecutor {
        type Command = AddElement;
        type Output = ();

        async fn execute(&self, _command: AddElement) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    fn executor() -> (AddElementExecutor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (AddElementExecutor { calls: calls.clone() }, calls)
    }

    fn element(s: &str) -> Box<dyn Any + Send> {
        Box::new(AddElement { element: s.into() })
    }

    #[tokio::test]
    async fn test_local_executor_runs() {
        let registry = ExecutorRegistry::default();
        let (exec, calls) = executor();
        registry.add_executor(exec).expect("bind");

        let local = registry.local("add_new_element").expect("local executor");
        let value = local.execute(element("test-elem")).await.expect("success");

        assert_eq!(value, serde_json::json!({"value": "test-elem"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_executor_error_is_wrapped() {
        let registry = ExecutorRegistry::default();
        registry.add_executor(executor().0).expect("bind");

        let local = registry.local("add_new_element").expect("local executor");
        let err = local.execute(element("EX_TEST")).await.expect_err("failure");
        assert!(matches!(err, CommandError::Executor(ref m) if m == "EX_TEST TEST MSG"));
    }

    #[tokio::test]
    async fn test_executor_panic_is_contained() {
        let registry = ExecutorRegistry::default();
        registry.add_executor(executor().0).expect("bind");

        let local = registry.local("add_new_element").expect("local executor");
        let err = local.execute(element("PANIC")).await.expect_err("failure");
        assert!(matches!(err, CommandError::Executor(ref m) if m == "executor blew up"));

        // Registry is still usable afterwards
        assert!(local.execute(element("after")).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_command_type_is_codec_error() {
        let registry = ExecutorRegistry::default();
        registry.add_executor(executor().0).expect("bind");

        let local = registry.local("add_new_element").expect("local executor");
        let err = local.execute(Box::new(42u32)).await.expect_err("mismatch");
        assert!(matches!(err, CommandError::Codec(_)));
    }

    #[test]
    fn test_replace_policy_last_registration_wins() {
        let registry = ExecutorRegistry::new(BindingPolicy::Replace);
        registry.add_executor(executor().0).expect("first");
        registry.add_executor(OtherExecutor).expect("second");

        let local = registry.local("add_new_element").expect("bound");
        assert!(format!("{local:?}").contains("OtherExecutor"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reject_policy_keeps_first_binding() {
        let registry = ExecutorRegistry::new(BindingPolicy::Reject);
        registry.add_executor(executor().0).expect("first");

        let err = registry.add_executor(OtherExecutor).expect_err("rejected");
        assert!(matches!(err, CommandError::ExecutorAlreadyBound(ref t) if t == "add_new_element"));

        let local = registry.local("add_new_element").expect("bound");
        assert!(format!("{local:?}").contains("AddElementExecutor"));
    }

    #[test]
    fn test_remote_binding() {
        let registry = ExecutorRegistry::default();
        registry.add_remote::<AddElement>("app_1_name").expect("bind");

        assert!(registry.local("add_new_element").is_none());
        match registry.lookup("add_new_element") {
            Some(ExecutorBinding::Remote { target_app }) => assert_eq!(target_app, "app_1_name"),
            other => panic!("unexpected binding: {other:?}"),
        }
    }

    struct EchoTag;

    #[async_trait]
    impl FallbackExecutor for EchoTag {
        async fn execute(&self, type_tag: &str, body: Value) -> Result<Value, ExecutorError> {
            if body.is_null() {
                return Err(ExecutorError::new("empty body"));
            }
            Ok(serde_json::json!({ "tag": type_tag, "body": body }))
        }
    }

    #[tokio::test]
    async fn test_fallback_receives_tag_and_body() {
        let registry = ExecutorRegistry::default();
        assert!(registry.fallback().is_none());
        registry.set_fallback(EchoTag).expect("bind");

        let fallback = registry.fallback().expect("fallback");
        let value = fallback
            .execute("custom-type", serde_json::json!({"k": 1}))
            .await
            .expect("success");
        assert_eq!(value, serde_json::json!({"tag": "custom-type", "body": {"k": 1}}));

        let err = fallback.execute("custom-type", Value::Null).await.expect_err("failure");
        assert!(matches!(err, CommandError::Executor(ref m) if m == "empty body"));
    }

    #[test]
    fn test_reject_policy_keeps_first_fallback() {
        let registry = ExecutorRegistry::new(BindingPolicy::Reject);
        registry.set_fallback(EchoTag).expect("first");
        assert!(registry.set_fallback(EchoTag).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_absent_lookup() {
        let registry = ExecutorRegistry::default();
        assert!(registry.lookup("missing").is_none());
        assert!(registry.is_empty());
    }
}
