//! DataHub metadata emission for published models.
//!
//! The model card is turned into an `mlModelProperties` aspect and sent as
//! an UPSERT metadata change proposal to the GMS REST endpoint.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::card::ModelCard;
use crate::error::Result;
use crate::hub::{HubClient, RepoId};
use crate::security::SecretString;

/// Custom property emitted with every model. Left empty.
pub const LAST_UPDATED_PROPERTY: &str = "Last Updated";
pub const ML_MODEL_PROPERTIES_ASPECT: &str = "mlModelProperties";
const RESTLI_PROTOCOL_VERSION: &str = "2.0.0";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("DataHub API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to encode aspect")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSpec {
    pub model_name: String,
    pub platform: String,
    pub env: String,
    pub gms_server: String,
    /// Description used when the model card has no body
    pub model_description: Option<String>,
}

pub fn make_data_platform_urn(platform: &str) -> String {
    if platform.starts_with("urn:li:dataPlatform:") {
        platform.to_string()
    } else {
        format!("urn:li:dataPlatform:{}", platform)
    }
}

pub fn make_ml_model_urn(platform: &str, model_name: &str, env: &str) -> String {
    format!(
        "urn:li:mlModel:({},{},{})",
        make_data_platform_urn(platform),
        model_name,
        env
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MlModelProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub custom_properties: BTreeMap<String, String>,
}

/// Coerce a card field to the string DataHub stores.
///
/// Strings are kept as-is, arrays are joined with `,`, null is empty and
/// anything else is its JSON text.
pub fn property_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(property_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Aspect for a model: card body (or `fallback_description`) plus every
/// card field as a custom property.
pub fn build_properties(card: Option<&ModelCard>, fallback_description: Option<&str>) -> MlModelProperties {
    let description = card
        .filter(|c| c.has_text())
        .map(|c| c.text.clone())
        .or_else(|| {
            fallback_description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
        });

    let mut custom_properties: BTreeMap<String, String> = card
        .map(|c| {
            c.data
                .iter()
                .map(|(k, v)| (k.clone(), property_string(v)))
                .collect()
        })
        .unwrap_or_default();
    custom_properties.insert(LAST_UPDATED_PROPERTY.to_string(), String::new());

    MlModelProperties {
        description,
        custom_properties,
    }
}

/// UPSERT of one aspect on one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataChangeProposal {
    pub entity_type: String,
    pub entity_urn: String,
    pub aspect_name: String,
    pub aspect: serde_json::Value,
}

impl MetadataChangeProposal {
    pub fn upsert_ml_model(urn: String, properties: &MlModelProperties) -> std::result::Result<Self, CatalogError> {
        Ok(Self {
            entity_type: "mlModel".to_string(),
            entity_urn: urn,
            aspect_name: ML_MODEL_PROPERTIES_ASPECT.to_string(),
            aspect: serde_json::to_value(properties)?,
        })
    }

    /// Body for `POST /aspects?action=ingestProposal`; the aspect travels as
    /// a JSON string.
    pub fn to_rest_body(&self) -> serde_json::Value {
        serde_json::json!({
            "proposal": {
                "entityType": self.entity_type,
                "entityUrn": self.entity_urn,
                "changeType": "UPSERT",
                "aspectName": self.aspect_name,
                "aspect": {
                    "value": self.aspect.to_string(),
                    "contentType": "application/json",
                },
            }
        })
    }
}

/// REST emitter for a DataHub GMS server.
pub struct DatahubEmitter {
    client: reqwest::Client,
    gms_server: String,
    token: Option<SecretString>,
}

impl DatahubEmitter {
    pub fn new(gms_server: &str, token: Option<SecretString>) -> Self {
        Self::with_client(gms_server, token, reqwest::Client::new())
    }

    pub fn with_connect_timeout(
        gms_server: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> std::result::Result<Self, CatalogError> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self::with_client(gms_server, token, client))
    }

    pub fn with_client(gms_server: &str, token: Option<SecretString>, client: reqwest::Client) -> Self {
        Self {
            client,
            gms_server: gms_server.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub async fn emit(&self, proposal: &MetadataChangeProposal) -> std::result::Result<(), CatalogError> {
        let url = format!("{}/aspects?action=ingestProposal", self.gms_server);
        let mut request = self
            .client
            .post(&url)
            .header("X-RestLi-Protocol-Version", RESTLI_PROTOCOL_VERSION)
            .json(&proposal.to_rest_body());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(CatalogError::Api {
                status,
                message: text,
            });
        }
        Ok(())
    }
}

/// Load the card for `spec.model_name` and emit it to `spec.gms_server`.
pub async fn send_metadata(
    hub: &HubClient,
    spec: &MetadataSpec,
    token: Option<SecretString>,
    timeout: Duration,
) -> Result<()> {
    let repo: RepoId = spec.model_name.parse()?;
    let card = hub.load_model_card(&repo).await?;
    if card.is_none() {
        info!("{} has no model card", spec.model_name);
    }

    let properties = build_properties(card.as_ref(), spec.model_description.as_deref());
    let urn = make_ml_model_urn(&spec.platform, &spec.model_name, &spec.env);
    let proposal = MetadataChangeProposal::upsert_ml_model(urn.clone(), &properties)?;

    let emitter = DatahubEmitter::with_connect_timeout(&spec.gms_server, token, timeout)?;
    emitter.emit(&proposal).await?;
    info!("Emitted {} for {}", ML_MODEL_PROPERTIES_ASPECT, urn);
    Ok(())
}
