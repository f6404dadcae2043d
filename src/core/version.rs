//! Protocol dialect discovery for received authorization requests.

use std::fmt;
use std::sync::OnceLock;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::core::object::UntypedObject;
use crate::error::{Error, Result};

/// Protocol dialects, ordered by release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SupportedVersion {
    #[serde(rename = "SIOPv2_ID1")]
    SiopV2Id1 = 70,
    #[serde(rename = "JWT_VC_PRESENTATION_PROFILE_v1")]
    JwtVcPresentationProfileV1 = 71,
    #[serde(rename = "SIOPv2_D11")]
    SiopV2D11 = 110,
}

impl SupportedVersion {
    pub const ALL: [SupportedVersion; 3] = [
        SupportedVersion::SiopV2Id1,
        SupportedVersion::JwtVcPresentationProfileV1,
        SupportedVersion::SiopV2D11,
    ];

    fn schema(&self) -> Json {
        match self {
            // The presentation profile shares the ID1 payload shape.
            SupportedVersion::SiopV2Id1 | SupportedVersion::JwtVcPresentationProfileV1 => json!({
                "type": "object",
                "required": ["response_type", "scope", "client_id", "redirect_uri"],
                "properties": {
                    "response_type": { "type": "string", "pattern": "(^|\\s)(id_token|vp_token)(\\s|$)" },
                    "scope": { "type": "string" },
                    "client_id": { "type": "string" },
                    "redirect_uri": { "type": "string" },
                    "registration": { "type": "object" },
                    "registration_uri": { "type": "string" },
                    "claims": { "type": "object" },
                    "request": { "type": "string" },
                    "request_uri": { "type": "string" }
                },
                "not": {
                    "anyOf": [
                        { "required": ["client_metadata"] },
                        { "required": ["client_metadata_uri"] },
                        { "required": ["presentation_definition"] },
                        { "required": ["presentation_definition_uri"] }
                    ]
                }
            }),
            SupportedVersion::SiopV2D11 => json!({
                "type": "object",
                "required": ["response_type", "scope", "client_id"],
                "anyOf": [
                    { "required": ["redirect_uri"] },
                    { "required": ["response_uri"] }
                ],
                "properties": {
                    "response_type": { "type": "string" },
                    "scope": { "type": "string" },
                    "client_id": { "type": "string" },
                    "redirect_uri": { "type": "string" },
                    "response_uri": { "type": "string" },
                    "client_metadata": { "type": "object" },
                    "client_metadata_uri": { "type": "string" },
                    "presentation_definition": { "type": ["object", "array"] },
                    "presentation_definition_uri": { "type": ["string", "array"] },
                    "claims": {
                        "type": "object",
                        "not": { "required": ["vp_token"] }
                    },
                    "request": { "type": "string" },
                    "request_uri": { "type": "string" }
                },
                "not": {
                    "anyOf": [
                        { "required": ["registration"] },
                        { "required": ["registration_uri"] }
                    ]
                }
            }),
        }
    }

    /// The compiled schema, built on first use and shared by dialects with the same shape.
    fn compiled(&self) -> Result<&'static JSONSchema> {
        static ID1: OnceLock<JSONSchema> = OnceLock::new();
        static D11: OnceLock<JSONSchema> = OnceLock::new();

        let cell = match self {
            SupportedVersion::SiopV2Id1 | SupportedVersion::JwtVcPresentationProfileV1 => &ID1,
            SupportedVersion::SiopV2D11 => &D11,
        };
        if let Some(compiled) = cell.get() {
            return Ok(compiled);
        }
        let compiled = JSONSchema::compile(&self.schema())
            .map_err(|e| Error::ValidationFailure(format!("invalid {self} schema: {e}")))?;
        Ok(cell.get_or_init(|| compiled))
    }

    /// Whether `payload` has the shape this dialect requires.
    pub fn matches(&self, payload: &Json) -> Result<bool> {
        Ok(self.compiled()?.is_valid(payload))
    }
}

impl fmt::Display for SupportedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupportedVersion::SiopV2Id1 => "SIOPv2_ID1",
            SupportedVersion::JwtVcPresentationProfileV1 => "JWT_VC_PRESENTATION_PROFILE_v1",
            SupportedVersion::SiopV2D11 => "SIOPv2_D11",
        }
        .fmt(f)
    }
}

/// The dialects `payload` satisfies, in ascending order.
///
/// The schemas are not mutually exclusive. Fails when none matches.
pub fn authorization_request_versions(payload: &UntypedObject) -> Result<Vec<SupportedVersion>> {
    let json = Json::from(payload.clone());
    let mut versions = vec![];
    for version in SupportedVersion::ALL {
        if version.matches(&json)? {
            versions.push(version);
        }
    }
    debug!("request matches dialects {versions:?}");
    if versions.is_empty() {
        return Err(Error::UnsupportedVersion(
            "the request does not match any supported dialect".into(),
        ));
    }
    Ok(versions)
}

/// Intersect the discovered dialects with those accepted by the caller.
///
/// An empty `accepted` list accepts every dialect.
pub fn check_version_supported(
    payload: &UntypedObject,
    accepted: &[SupportedVersion],
) -> Result<Vec<SupportedVersion>> {
    let versions = authorization_request_versions(payload)?;
    if accepted.is_empty() {
        return Ok(versions);
    }
    let supported: Vec<_> = versions
        .into_iter()
        .filter(|v| accepted.contains(v))
        .collect();
    if supported.is_empty() {
        return Err(Error::UnsupportedVersion(format!(
            "the request matches none of {accepted:?}"
        )));
    }
    Ok(supported)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schemas_are_compiled_once() {
        let first = SupportedVersion::SiopV2D11.compiled().unwrap();
        let second = SupportedVersion::SiopV2D11.compiled().unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(std::ptr::eq(
            SupportedVersion::SiopV2Id1.compiled().unwrap(),
            SupportedVersion::JwtVcPresentationProfileV1.compiled().unwrap()
        ));
    }

    fn payload(value: Json) -> UntypedObject {
        value.try_into().unwrap()
    }

    fn id1() -> UntypedObject {
        payload(json!({
            "response_type": "id_token",
            "scope": "openid",
            "client_id": "did:example:rp",
            "redirect_uri": "https://acme.com/hello",
            "registration": { "subject_syntax_types_supported": ["did:ethr:"] }
        }))
    }

    fn d11() -> UntypedObject {
        payload(json!({
            "response_type": "vp_token",
            "scope": "openid",
            "client_id": "did:example:rp",
            "response_uri": "https://acme.com/hello",
            "client_metadata": { "subject_syntax_types_supported": ["did:ethr:"] },
            "presentation_definition": { "id": "pd", "input_descriptors": [] }
        }))
    }

    #[test]
    fn ordering() {
        assert!(SupportedVersion::SiopV2Id1 < SupportedVersion::JwtVcPresentationProfileV1);
        assert!(SupportedVersion::JwtVcPresentationProfileV1 < SupportedVersion::SiopV2D11);
    }

    #[test]
    fn discovers_id1_and_profile() {
        assert_eq!(
            authorization_request_versions(&id1()).unwrap(),
            vec![
                SupportedVersion::SiopV2Id1,
                SupportedVersion::JwtVcPresentationProfileV1
            ]
        );
    }

    #[test]
    fn discovers_d11() {
        assert_eq!(
            authorization_request_versions(&d11()).unwrap(),
            vec![SupportedVersion::SiopV2D11]
        );
    }

    #[test]
    fn no_dialect() {
        let err = authorization_request_versions(&payload(json!({ "scope": "openid" }))).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(_)));
    }

    #[test]
    fn intersection() {
        assert_eq!(
            check_version_supported(&id1(), &[]).unwrap().len(),
            2
        );
        assert_eq!(
            check_version_supported(&id1(), &[SupportedVersion::JwtVcPresentationProfileV1])
                .unwrap(),
            vec![SupportedVersion::JwtVcPresentationProfileV1]
        );
        assert!(matches!(
            check_version_supported(&id1(), &[SupportedVersion::SiopV2D11]),
            Err(Error::UnsupportedVersion(_))
        ));
    }
}
