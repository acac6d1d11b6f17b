// Resource descriptors: one immutable definition per backend endpoint.
// A descriptor knows how to turn parameters into a cache key and a request,
// and how to check a response payload against the expected shape.

use crate::cache::CachedValue;
use crate::error::QueryError;
use crate::transport::TransportRequest;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Identity of a cacheable query: resource name, path values in template
/// order, and the remaining parameters keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    resource: String,
    segments: Vec<String>,
    fields: BTreeMap<String, String>,
}

impl ResourceKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            segments: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_segment(mut self, value: impl Into<String>) -> Self {
        self.segments.push(value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        if !self.fields.is_empty() {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            write!(f, "?{}", fields.join("&"))?;
        }
        Ok(())
    }
}

/// Query parameters, stored by name so insertion order never matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.values.insert(name.into(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Flattens a serializable struct into parameters. `None` fields are
    /// skipped; nested arrays and objects are rejected.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, QueryError> {
        let value = serde_json::to_value(value)
            .map_err(|e| QueryError::ValidationError(format!("unserializable params: {}", e)))?;

        let object = match value {
            Value::Object(object) => object,
            Value::Null => return Ok(Self::new()),
            other => {
                return Err(QueryError::ValidationError(format!(
                    "params must be an object, got {}",
                    other
                )))
            }
        };

        let mut params = Self::new();
        for (name, value) in object {
            match value {
                Value::Null => {}
                Value::String(text) => params.insert(name, text),
                Value::Bool(flag) => params.insert(name, flag),
                Value::Number(number) => params.insert(name, number),
                Value::Array(_) | Value::Object(_) => {
                    return Err(QueryError::ValidationError(format!(
                        "param {:?} must be a scalar",
                        name
                    )))
                }
            }
        }
        Ok(params)
    }
}

// Cache and retry policy of a descriptor. Unset fields fall back to the
// client configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub freshness: Option<Duration>,
    pub retry_budget: Option<u32>,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub freshness: Duration,
    pub retry_budget: u32,
    pub idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryParam {
    name: String,
    required: bool,
}

pub type ParamValidator = fn(&Params) -> Result<(), String>;

pub struct ResourceDescriptor<R> {
    name: &'static str,
    method: Method,
    template: Vec<Segment>,
    query: Vec<QueryParam>,
    policy: CachePolicy,
    validator: Option<ParamValidator>,
    _response: PhantomData<fn() -> R>,
}

impl<R> Clone for ResourceDescriptor<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            method: self.method.clone(),
            template: self.template.clone(),
            query: self.query.clone(),
            policy: self.policy,
            validator: self.validator,
            _response: PhantomData,
        }
    }
}

impl<R> fmt::Debug for ResourceDescriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("template", &self.template)
            .field("policy", &self.policy)
            .finish()
    }
}

fn parse_template(template: &str) -> Vec<Segment> {
    template
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            match part
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(part.to_string()),
            }
        })
        .collect()
}

impl<R> ResourceDescriptor<R>
where
    R: DeserializeOwned + Send + Sync + 'static,
{
    /// `template` is a path relative to the configured base url, with
    /// `{name}` placeholders for path parameters, e.g. `config/{surface}`.
    pub fn new(name: &'static str, method: Method, template: &str) -> Self {
        Self {
            name,
            method,
            template: parse_template(template),
            query: Vec::new(),
            policy: CachePolicy::default(),
            validator: None,
            _response: PhantomData,
        }
    }

    pub fn get(name: &'static str, template: &str) -> Self {
        Self::new(name, Method::GET, template)
    }

    pub fn query_param(mut self, name: &str) -> Self {
        self.query.push(QueryParam {
            name: name.to_string(),
            required: false,
        });
        self
    }

    pub fn required_query_param(mut self, name: &str) -> Self {
        self.query.push(QueryParam {
            name: name.to_string(),
            required: true,
        });
        self
    }

    pub fn freshness(mut self, window: Duration) -> Self {
        self.policy.freshness = Some(window);
        self
    }

    pub fn retry_budget(mut self, retries: u32) -> Self {
        self.policy.retry_budget = Some(retries);
        self
    }

    // Allows retrying server-reported failures
    pub fn idempotent(mut self) -> Self {
        self.policy.idempotent = true;
        self
    }

    pub fn validate_with(mut self, validator: ParamValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn path_params(&self) -> impl Iterator<Item = &str> {
        self.template.iter().filter_map(|segment| match segment {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn is_path_param(&self, name: &str) -> bool {
        self.path_params().any(|param| param == name)
    }

    pub fn build_key(&self, params: &Params) -> ResourceKey {
        let mut key = ResourceKey::new(self.name);
        for name in self.path_params() {
            if let Some(value) = params.get(name) {
                key = key.with_segment(value);
            }
        }
        for (name, value) in params.iter() {
            if !self.is_path_param(name) {
                key = key.with_field(name, value);
            }
        }
        key
    }

    pub fn validate(&self, params: &Params) -> Result<(), QueryError> {
        for name in self.path_params() {
            match params.get(name) {
                Some(value) if !value.is_empty() => {}
                _ => {
                    return Err(QueryError::ValidationError(format!(
                        "{}: missing path parameter {:?}",
                        self.name, name
                    )))
                }
            }
        }

        for param in self.query.iter().filter(|param| param.required) {
            if params.get(&param.name).is_none() {
                return Err(QueryError::ValidationError(format!(
                    "{}: missing required parameter {:?}",
                    self.name, param.name
                )));
            }
        }

        for (name, _) in params.iter() {
            if !self.is_path_param(name) && !self.query.iter().any(|param| param.name == name) {
                return Err(QueryError::ValidationError(format!(
                    "{}: unexpected parameter {:?}",
                    self.name, name
                )));
            }
        }

        if let Some(validator) = self.validator {
            validator(params)
                .map_err(|reason| QueryError::ValidationError(format!("{}: {}", self.name, reason)))?;
        }
        Ok(())
    }

    pub fn build_request(&self, base: &Url, params: &Params) -> Result<TransportRequest, QueryError> {
        self.validate(params)?;

        let mut url = base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                QueryError::ValidationError(format!("base url {} cannot carry a path", base))
            })?;
            path.pop_if_empty();
            for segment in &self.template {
                match segment {
                    Segment::Literal(literal) => path.push(literal),
                    // validate() guarantees every path parameter is present
                    Segment::Param(name) => path.push(params.get(name).unwrap_or_default()),
                };
            }
        }

        let rest: Vec<(&str, &str)> = params
            .iter()
            .filter(|(name, _)| !self.is_path_param(name))
            .collect();

        let sends_query = matches!(self.method, Method::GET | Method::HEAD | Method::DELETE);
        let mut body = None;
        if sends_query {
            if !rest.is_empty() {
                url.query_pairs_mut().extend_pairs(rest.iter().copied());
            }
        } else {
            let object: Map<String, Value> = rest
                .iter()
                .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
                .collect();
            body = Some(Value::Object(object));
        }

        let mut request = TransportRequest::new(self.method.clone(), url);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        Ok(request)
    }

    /// Strictly decodes a response payload into the response type.
    pub fn parse(&self, body: &[u8]) -> Result<R, QueryError> {
        decode::<R>(body)
    }

    pub(crate) fn decoder(&self) -> fn(&[u8]) -> Result<CachedValue, QueryError> {
        decode_cached::<R>
    }
}

fn decode<R: DeserializeOwned>(body: &[u8]) -> Result<R, QueryError> {
    let mut deserializer = serde_json::Deserializer::from_slice(body);
    let value: R = serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
        let path = e.path().to_string();
        QueryError::SchemaError(format!("{} (at {})", e.into_inner(), path))
    })?;
    deserializer
        .end()
        .map_err(|e| QueryError::SchemaError(format!("trailing data: {}", e)))?;
    Ok(value)
}

fn decode_cached<R: DeserializeOwned + Send + Sync + 'static>(
    body: &[u8],
) -> Result<CachedValue, QueryError> {
    let value: CachedValue = Arc::new(decode::<R>(body)?);
    Ok(value)
}
