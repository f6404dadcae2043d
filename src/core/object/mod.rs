use anyhow::{Context, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// An untyped (JSON) Object from which [TypedParameters](TypedParameter) can be parsed.
///
/// Backs request payloads, request object payloads, id token claims and response payloads.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UntypedObject(pub(crate) Map<String, Json>);

/// A strongly typed parameter that can represent metadata entries or request parameters.
pub trait TypedParameter:
    TryFrom<Json, Error = anyhow::Error> + TryInto<Json> + Clone + std::fmt::Debug
{
    const KEY: &'static str;
}

impl UntypedObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a [TypedParameter] from the Object or return the default value.
    ///
    /// Note that this method clones the underlying data.
    pub fn get_or_default<T: TypedParameter + Default>(&self) -> Result<T> {
        Ok(self
            .0
            .get(T::KEY)
            .cloned()
            .map(TryInto::try_into)
            .transpose()?
            .unwrap_or_default())
    }

    /// Get a [TypedParameter] from the Object.
    ///
    /// Note that this method clones the underlying data.
    pub fn get<T: TypedParameter>(&self) -> Option<Result<T>> {
        Some(self.0.get(T::KEY)?.clone().try_into().map_err(Into::into))
    }

    /// Remove a [TypedParameter] from the Object.
    pub fn remove<T: TypedParameter>(&mut self) -> Option<Result<T>> {
        Some(self.0.remove(T::KEY)?.try_into().map_err(Into::into))
    }

    /// Insert a [TypedParameter].
    ///
    /// Returns the existing [TypedParameter] if one already exists.
    ///
    /// # Errors
    /// Returns an error if there was already an entry in the Object, but it could not be parsed from JSON.
    pub fn insert<T: TypedParameter>(&mut self, t: T) -> Option<Result<T>> {
        match t.try_into() {
            Err(_) => Some(Err(Error::msg("failed to parse typed parameter"))),
            Ok(value) => Some(
                self.0
                    .insert(T::KEY.to_owned(), value)?
                    .try_into()
                    .map_err(Into::into),
            ),
        }
    }

    /// Raw access by key, for fields without a typed representation.
    pub fn get_raw(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn insert_raw(&mut self, key: impl Into<String>, value: Json) -> Option<Json> {
        self.0.insert(key.into(), value)
    }

    pub fn remove_raw(&mut self, key: &str) -> Option<Json> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String value of a field, if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Json::as_str)
    }

    /// Overlay `other` onto `self`; fields present in `other` win.
    pub fn merge(mut self, other: &UntypedObject) -> Self {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Json)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Json> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Json> {
        self.0
    }
}

impl From<Map<String, Json>> for UntypedObject {
    fn from(value: Map<String, Json>) -> Self {
        Self(value)
    }
}

impl TryFrom<Json> for UntypedObject {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self> {
        match value {
            Json::Object(map) => Ok(Self(map)),
            _ => Err(Error::msg("expected a JSON object")),
        }
    }
}

impl From<UntypedObject> for Json {
    fn from(value: UntypedObject) -> Self {
        value.0.into()
    }
}

pub trait ParsingErrorContext {
    type T: TypedParameter;

    fn parsing_error(self) -> Result<Self::T>;
}

impl<T: TypedParameter> ParsingErrorContext for Option<Result<T>> {
    type T = T;

    fn parsing_error(self) -> Result<T> {
        self.context(format!("'{}' is missing", T::KEY))?
            .context(format!("'{}' could not be parsed", T::KEY))
    }
}

impl<T: TypedParameter> ParsingErrorContext for Result<T> {
    type T = T;

    fn parsing_error(self) -> Result<T> {
        self.context(format!("'{}' could not be parsed", T::KEY))
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Nonce(String);

    impl TypedParameter for Nonce {
        const KEY: &'static str = "nonce";
    }

    impl TryFrom<Json> for Nonce {
        type Error = Error;

        fn try_from(value: Json) -> Result<Self> {
            Ok(Self(serde_json::from_value(value)?))
        }
    }

    impl From<Nonce> for Json {
        fn from(value: Nonce) -> Self {
            value.0.into()
        }
    }

    #[test]
    fn typed_access() {
        let mut object: UntypedObject = json!({ "nonce": "abc" }).try_into().unwrap();
        assert_eq!(object.get::<Nonce>().unwrap().unwrap(), Nonce("abc".into()));

        let previous = object.insert(Nonce("def".into())).unwrap().unwrap();
        assert_eq!(previous.0, "abc");

        object.remove::<Nonce>();
        assert!(object.get::<Nonce>().parsing_error().is_err());
    }

    #[test]
    fn merge_overrides() {
        let a: UntypedObject = json!({ "a": 1, "b": 1 }).try_into().unwrap();
        let b: UntypedObject = json!({ "b": 2 }).try_into().unwrap();
        assert_eq!(Json::from(a.merge(&b)), json!({ "a": 1, "b": 2 }));
    }
}
