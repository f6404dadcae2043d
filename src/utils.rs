use anyhow::{bail, Error};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
pub struct NonEmptyVec<T: Clone>(Vec<T>);

impl<T: Clone> NonEmptyVec<T> {
    pub fn new(t: T) -> Self {
        Self(vec![t])
    }

    pub fn maybe_new(v: Vec<T>) -> Option<Self> {
        Self::try_from(v).ok()
    }

    pub fn push(&mut self, t: T) {
        self.0.push(t)
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T: Clone> TryFrom<Vec<T>> for NonEmptyVec<T> {
    type Error = Error;

    fn try_from(v: Vec<T>) -> Result<NonEmptyVec<T>, Error> {
        if v.is_empty() {
            bail!("cannot create a NonEmptyVec from an empty Vec")
        }
        Ok(NonEmptyVec(v))
    }
}

impl<T: Clone> From<NonEmptyVec<T>> for Vec<T> {
    fn from(NonEmptyVec(v): NonEmptyVec<T>) -> Vec<T> {
        v
    }
}

impl<T: Clone> AsRef<[T]> for NonEmptyVec<T> {
    fn as_ref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Clone> Deref for NonEmptyVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

/// Random alphanumeric value, used for nonces.
pub fn gen_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Random opaque value used to correlate a request with its response.
pub fn gen_state() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Seconds since the unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn non_empty_vec() {
        assert!(NonEmptyVec::<u8>::maybe_new(vec![]).is_none());
        let v: NonEmptyVec<u8> = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(&*v, &[1, 2]);
        assert!(serde_json::from_str::<NonEmptyVec<u8>>("[]").is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let a = gen_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, gen_nonce());
        assert_ne!(gen_state(), gen_state());
    }
}
