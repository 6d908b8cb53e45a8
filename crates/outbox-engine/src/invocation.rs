//! Serializable descriptions of handler calls.
//!
//! A [`HandlerCall`] is what a caller builds when scheduling: handler name,
//! method name and ordered arguments, one of which is the live transaction (or
//! its context). The transaction manager turns it into an [`Invocation`], which
//! replaces the live handle with a slot marker so it can be persisted. At
//! execution time the invocation is rebound to a fresh transaction as a
//! [`BoundInvocation`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transaction::Transaction;
use crate::{OutboxError, OutboxResult};

/// A single persisted argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Argument {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    /// Position where the live transaction is injected at execution time.
    Transaction,
    /// Position where the live transaction context is injected at execution time.
    Context,
}

impl Argument {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
            Self::Transaction => "transaction",
            Self::Context => "context",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// True for the transaction and context slot markers.
    pub fn is_slot(&self) -> bool {
        matches!(self, Self::Transaction | Self::Context)
    }

    /// Whether the value reads back unchanged once persisted. NaN and the
    /// infinities are written as JSON `null` and do not.
    pub fn is_persistable(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::Json(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::Transaction => f.write_str("<transaction>"),
            Self::Context => f.write_str("<context>"),
        }
    }
}

macro_rules! argument_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Argument {
                fn from(value: $ty) -> Self {
                    Self::$variant(value $(as $cast)?)
                }
            }
        )*
    };
}

argument_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int as i64,
    u32 => Int as i64,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<Argument>> From<Option<T>> for Argument {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A persisted handler call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Name the handler is registered under.
    pub class_name: String,
    /// Method to dispatch to on the handler.
    pub method_name: String,
    /// Ordered arguments, with slot markers in place of live transactions.
    pub args: Vec<Argument>,
    /// Diagnostic context captured at schedule time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mdc: Option<BTreeMap<String, String>>,
}

impl Invocation {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Argument>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            args,
            mdc: None,
        }
    }

    /// Human-readable form, e.g. `Inserter.insert(3, "Whee", <transaction>)`.
    pub fn description(&self) -> String {
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        format!("{}.{}({})", self.class_name, self.method_name, args.join(", "))
    }

    /// Rejects arguments that could not be read back after saving.
    pub fn validate(&self) -> OutboxResult<()> {
        match self.args.iter().position(|arg| !arg.is_persistable()) {
            Some(index) => Err(OutboxError::InvalidArgument(format!(
                "{}.{} argument {index} is {}, which cannot be persisted",
                self.class_name, self.method_name, self.args[index]
            ))),
            None => Ok(()),
        }
    }

    pub fn to_json(&self) -> OutboxResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> OutboxResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// One argument of a call being scheduled.
pub enum CallArg<TX: Transaction> {
    Value(Argument),
    Transaction(TX),
    Context(TX::Context),
}

impl<TX: Transaction> fmt::Debug for CallArg<TX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(arg) => f.debug_tuple("Value").field(arg).finish(),
            Self::Transaction(_) => f.write_str("Transaction"),
            Self::Context(ctx) => f.debug_tuple("Context").field(ctx).finish(),
        }
    }
}

/// A call to schedule: the explicit command object callers build instead of
/// invoking the handler directly.
///
/// ```ignore
/// let call = HandlerCall::new("Inserter", "insert")
///     .arg(3)
///     .arg("Whee")
///     .transaction(tx.clone());
/// outbox.schedule(call).await?;
/// ```
#[derive(Debug)]
pub struct HandlerCall<TX: Transaction> {
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) args: Vec<CallArg<TX>>,
    pub(crate) mdc: Option<BTreeMap<String, String>>,
    pub(crate) unique_request_id: Option<String>,
}

impl<TX: Transaction> HandlerCall<TX> {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            args: Vec::new(),
            mdc: None,
            unique_request_id: None,
        }
    }

    /// Appends a plain value argument.
    pub fn arg(mut self, value: impl Into<Argument>) -> Self {
        self.args.push(CallArg::Value(value.into()));
        self
    }

    /// Appends the live transaction the call is enlisted in.
    pub fn transaction(mut self, tx: TX) -> Self {
        self.args.push(CallArg::Transaction(tx));
        self
    }

    /// Appends the context of the transaction the call is enlisted in.
    pub fn context(mut self, context: TX::Context) -> Self {
        self.args.push(CallArg::Context(context));
        self
    }

    /// Adds a diagnostic context entry carried to execution.
    pub fn mdc(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.mdc
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Makes the call idempotent: a second call with the same id is refused.
    pub fn unique_request_id(mut self, id: impl Into<String>) -> Self {
        self.unique_request_id = Some(id.into());
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn args(&self) -> &[CallArg<TX>] {
        &self.args
    }
}

/// The outcome of extracting the transaction from a [`HandlerCall`].
#[derive(Debug)]
pub struct TransactionalInvocation<TX: Transaction> {
    /// The transaction the entry must be saved in.
    pub transaction: TX,
    /// The persistable invocation.
    pub invocation: Invocation,
    pub unique_request_id: Option<String>,
}

/// An invocation rebound to the transaction it is executing in.
pub struct BoundInvocation<TX: Transaction> {
    invocation: Invocation,
    transaction: TX,
}

impl<TX: Transaction> BoundInvocation<TX> {
    pub fn new(invocation: Invocation, transaction: TX) -> Self {
        Self {
            invocation,
            transaction,
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn class_name(&self) -> &str {
        &self.invocation.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.invocation.method_name
    }

    pub fn args(&self) -> &[Argument] {
        &self.invocation.args
    }

    pub fn mdc(&self) -> Option<&BTreeMap<String, String>> {
        self.invocation.mdc.as_ref()
    }

    /// The live transaction for this execution.
    pub fn transaction(&self) -> &TX {
        &self.transaction
    }

    /// The context of the live transaction for this execution.
    pub fn context(&self) -> TX::Context {
        self.transaction.context()
    }

    pub fn arg(&self, index: usize) -> OutboxResult<&Argument> {
        self.invocation.args.get(index).ok_or_else(|| {
            OutboxError::InvalidArgument(format!(
                "{} has no argument at position {index}",
                self.invocation.description()
            ))
        })
    }

    pub fn int(&self, index: usize) -> OutboxResult<i64> {
        let arg = self.arg(index)?;
        arg.as_i64().ok_or_else(|| self.mismatch(index, "int", arg))
    }

    pub fn text(&self, index: usize) -> OutboxResult<&str> {
        let arg = self.arg(index)?;
        arg.as_str().ok_or_else(|| self.mismatch(index, "text", arg))
    }

    pub fn bool(&self, index: usize) -> OutboxResult<bool> {
        let arg = self.arg(index)?;
        arg.as_bool().ok_or_else(|| self.mismatch(index, "bool", arg))
    }

    pub fn json(&self, index: usize) -> OutboxResult<&serde_json::Value> {
        let arg = self.arg(index)?;
        arg.as_json().ok_or_else(|| self.mismatch(index, "json", arg))
    }

    fn mismatch(&self, index: usize, expected: &str, found: &Argument) -> OutboxError {
        OutboxError::InvalidArgument(format!(
            "{}: argument {index} is {}, expected {expected}",
            self.invocation.description(),
            found.type_name()
        ))
    }
}

impl<TX: Transaction> fmt::Debug for BoundInvocation<TX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundInvocation")
            .field("invocation", &self.invocation)
            .field("context", &self.transaction.context())
            .finish()
    }
}
