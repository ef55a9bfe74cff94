//! Client contracts.
//!
//! A contract is a struct of [`Stub`] slots, one per remote method of a
//! provider. [`Contract::bind`] asks a [`Binder`] for every slot by method
//! name; the binder validates the slot, resolves its call settings and hands
//! back a callable stub. A slot that fails validation is still returned, but
//! calling it reports the validation error.
//!
//! ```ignore
//! struct HelloService {
//!     hello: Stub<HelloRequest, HelloResponse>,
//! }
//!
//! impl Contract for HelloService {
//!     fn bind(binder: &mut Binder<'_>) -> Self {
//!         Self { hello: binder.slot("Hello") }
//!     }
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserializer, Serialize};
use tracing::{debug, error};

use super::ConsumerInner;
use super::method_info::MethodInfo;
use super::stub::Stub;

pub trait Contract: Sized {
    fn bind(binder: &mut Binder<'_>) -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("method name must not be empty")]
    EmptyName,

    #[error("method {0} is declared more than once")]
    Duplicate(String),

    #[error("input param of {method} must be a struct, found {found}")]
    InputNotRecord { method: String, found: Shape },

    #[error("output param of {method} must be a struct, found {found}")]
    OutputNotRecord { method: String, found: Shape },
}

/// Hands out stubs for one provider while a contract is being bound.
pub struct Binder<'a> {
    consumer: &'a Arc<ConsumerInner>,
    provider_name: &'a str,
    seen: HashSet<String>,
    errors: Vec<ContractError>,
}

impl<'a> Binder<'a> {
    pub(super) fn new(consumer: &'a Arc<ConsumerInner>, provider_name: &'a str) -> Self {
        Self {
            consumer,
            provider_name,
            seen: HashSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider_name
    }

    /// Bind the stub for `method_name`.
    pub fn slot<Req, Resp>(&mut self, method_name: &str) -> Stub<Req, Resp>
    where
        Req: Serialize + DeserializeOwned,
        Resp: DeserializeOwned,
    {
        match self.validate::<Req, Resp>(method_name) {
            Ok(()) => {
                let info = MethodInfo::resolve(
                    self.provider_name,
                    method_name,
                    &self.consumer.config.reference,
                );
                debug!(
                    provider = %self.provider_name,
                    method = %method_name,
                    load_balance = %info.load_balance,
                    timeout_ms = info.timeout.as_millis() as u64,
                    retries = info.retries,
                    "bound contract method"
                );
                Stub::bound(self.consumer.clone(), info)
            }
            Err(e) => {
                error!(provider = %self.provider_name, method = %method_name, error = %e, "cannot bind contract method");
                self.errors.push(e.clone());
                Stub::unbound(e)
            }
        }
    }

    /// Validation failures collected so far.
    pub fn errors(&self) -> &[ContractError] {
        &self.errors
    }

    pub(super) fn into_errors(self) -> Vec<ContractError> {
        self.errors
    }

    fn validate<Req, Resp>(&mut self, method_name: &str) -> Result<(), ContractError>
    where
        Req: DeserializeOwned,
        Resp: DeserializeOwned,
    {
        if method_name.is_empty() {
            return Err(ContractError::EmptyName);
        }
        if !self.seen.insert(method_name.to_string()) {
            return Err(ContractError::Duplicate(method_name.to_string()));
        }

        let input = shape_of::<Req>();
        if input != Shape::Record {
            return Err(ContractError::InputNotRecord {
                method: method_name.to_string(),
                found: input,
            });
        }
        let output = shape_of::<Resp>();
        if output != Shape::Record {
            return Err(ContractError::OutputNotRecord {
                method: method_name.to_string(),
                found: output,
            });
        }
        Ok(())
    }
}

/// The data-model shape a type deserializes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Record,
    Map,
    Sequence,
    Scalar,
    Option,
    Unit,
    Enum,
    Any,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::Record => "struct",
            Shape::Map => "map",
            Shape::Sequence => "sequence",
            Shape::Scalar => "scalar",
            Shape::Option => "option",
            Shape::Unit => "unit",
            Shape::Enum => "enum",
            Shape::Any => "self-describing value",
        };
        f.write_str(name)
    }
}

/// Find out which shape `T` asks its deserializer for.
pub fn shape_of<T: DeserializeOwned>() -> Shape {
    match T::deserialize(ShapeSniffer) {
        Err(Sniffed(shape)) => shape,
        Ok(_) => Shape::Any,
    }
}

/// A deserializer that fails on the first request, reporting what was asked for.
struct ShapeSniffer;

#[derive(Debug)]
struct Sniffed(Shape);

impl fmt::Display for Sniffed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sniffed {}", self.0)
    }
}

impl std::error::Error for Sniffed {}

impl de::Error for Sniffed {
    fn custom<T: fmt::Display>(_msg: T) -> Self {
        Sniffed(Shape::Any)
    }
}

macro_rules! sniff_as {
    ($shape:expr => $($method:ident)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Sniffed> {
                Err(Sniffed($shape))
            }
        )*
    };
}

impl<'de> Deserializer<'de> for ShapeSniffer {
    type Error = Sniffed;

    sniff_as!(Shape::Any => deserialize_any deserialize_ignored_any);
    sniff_as!(Shape::Scalar =>
        deserialize_bool deserialize_i8 deserialize_i16 deserialize_i32 deserialize_i64
        deserialize_i128 deserialize_u8 deserialize_u16 deserialize_u32 deserialize_u64
        deserialize_u128 deserialize_f32 deserialize_f64 deserialize_char deserialize_str
        deserialize_string deserialize_bytes deserialize_byte_buf deserialize_identifier);
    sniff_as!(Shape::Option => deserialize_option);
    sniff_as!(Shape::Unit => deserialize_unit);
    sniff_as!(Shape::Sequence => deserialize_seq);
    sniff_as!(Shape::Map => deserialize_map);

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Sniffed> {
        Err(Sniffed(Shape::Record))
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _visitor: V,
    ) -> Result<V::Value, Sniffed> {
        Err(Sniffed(Shape::Record))
    }

    // A newtype has the shape of what it wraps.
    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Sniffed> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, _visitor: V) -> Result<V::Value, Sniffed> {
        Err(Sniffed(Shape::Sequence))
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        _visitor: V,
    ) -> Result<V::Value, Sniffed> {
        Err(Sniffed(Shape::Sequence))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Sniffed> {
        Err(Sniffed(Shape::Enum))
    }
}
