//! Payload schemas: turn a stored JSON payload into the handler's input type.

use crate::error::PayloadValidationError;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use validator::Validate;

/// Parses a job payload before the handler runs.
///
/// A payload that fails to parse is never redelivered: the job moves straight
/// to `failed`.
pub trait PayloadSchema: Send + Sync + 'static {
    /// Type passed to the handler.
    type Output: Send + 'static;

    /// Parse or reject the payload.
    fn parse(&self, payload: &serde_json::Value) -> Result<Self::Output, PayloadValidationError>;
}

/// Any payload, passed through as raw JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawJson;

impl PayloadSchema for RawJson {
    type Output = serde_json::Value;

    fn parse(&self, payload: &serde_json::Value) -> Result<Self::Output, PayloadValidationError> {
        Ok(payload.clone())
    }
}

/// Payload deserialized into `T` with serde.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadSchema for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn parse(&self, payload: &serde_json::Value) -> Result<T, PayloadValidationError> {
        Ok(T::deserialize(payload)?)
    }
}

/// Payload deserialized into `T`, then checked with its `validator` rules.
pub struct Validated<T>(PhantomData<fn() -> T>);

impl<T> Validated<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Validated<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadSchema for Validated<T>
where
    T: DeserializeOwned + Validate + Send + 'static,
{
    type Output = T;

    fn parse(&self, payload: &serde_json::Value) -> Result<T, PayloadValidationError> {
        let value = T::deserialize(payload)?;
        value
            .validate()
            .map_err(|e| PayloadValidationError::Invalid(e.to_string()))?;
        Ok(value)
    }
}
