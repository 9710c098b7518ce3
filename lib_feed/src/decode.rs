//! # Listing Decoders
//!
//! Turning a raw listing payload into a structured `Listing` belongs to an
//! external collaborator; the pipeline only depends on the two traits below.
//! The JSON implementations cover the public feed's item shape and a live-notify
//! payload that carries a JSON array of the same items.
//!
//! Structural validation is thin: a listing without an identity
//! hash is rejected, everything else is best-effort.

use serde_json::Value;

use crate::error::IngestError;
use crate::model::feed_page::ListingGroup;
use crate::model::listing::{Listing, Price};

/// Values inherited from the container a raw item was found in.
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    pub league: Option<String>,
    pub seller: Option<String>,
    /// Price note applying to the whole container (tab-wide `~price`).
    pub fallback_note: Option<String>,
    pub origin: Option<String>,
}

impl DecodeContext {
    pub fn from_group(group: &ListingGroup) -> Self {
        Self {
            league: group.league.clone(),
            seller: group.account_name.clone(),
            fallback_note: group.stash.clone(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Decodes one raw feed item.
pub trait ListingDecoder: Send + Sync {
    fn decode(&self, raw: &Value, context: &DecodeContext) -> Result<Listing, IngestError>;
}

/// Decodes the `data` field of a live-notify reply.
///
/// An error fails the whole payload; individual bad items should be skipped by
/// the implementation.
pub trait NotifyPayloadDecoder: Send + Sync {
    fn decode_payload(&self, data: &str, context: &DecodeContext) -> Result<Vec<Listing>, IngestError>;
}

/// Decoder for the public feed's JSON item objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonListingDecoder;

impl ListingDecoder for JsonListingDecoder {
    fn decode(&self, raw: &Value, context: &DecodeContext) -> Result<Listing, IngestError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| IngestError::Decode("listing is not a JSON object".into()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::Decode("listing has no identity hash".into()))?;

        let league = obj
            .get("league")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| context.league.clone())
            .unwrap_or_default();

        let name = display_name(
            obj.get("name").and_then(Value::as_str).unwrap_or_default(),
            obj.get("typeLine").and_then(Value::as_str).unwrap_or_default(),
        );

        let price = obj
            .get("note")
            .and_then(Value::as_str)
            .and_then(Price::from_note)
            .or_else(|| context.fallback_note.as_deref().and_then(Price::from_note));

        let mut modifiers = string_array(obj.get("implicitMods"));
        modifiers.extend(string_array(obj.get("explicitMods")));

        let mut listing = Listing::new(id, league, name).with_modifiers(modifiers);
        listing.price = price;
        listing.seller = context.seller.clone();
        listing.origin = context.origin.clone();
        Ok(listing)
    }
}

/// Live-notify payload decoder expecting `data` to be a JSON array of feed items.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonNotifyPayloadDecoder {
    item: JsonListingDecoder,
}

impl NotifyPayloadDecoder for JsonNotifyPayloadDecoder {
    fn decode_payload(&self, data: &str, context: &DecodeContext) -> Result<Vec<Listing>, IngestError> {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<Value> = serde_json::from_str(data)
            .map_err(|e| IngestError::Decode(format!("live payload is not a JSON array: {}", e)))?;

        let mut listings = Vec::with_capacity(items.len());
        for raw in &items {
            match self.item.decode(raw, context) {
                Ok(listing) => listings.push(listing),
                Err(e) => log::debug!("Skipping live listing: {}", e),
            }
        }
        Ok(listings)
    }
}

/// Joins `name` and `typeLine`, stripping the `<<set:..>>` markup the upstream embeds.
fn display_name(name: &str, type_line: &str) -> String {
    let name = strip_markup(name);
    let type_line = strip_markup(type_line);
    match (name.is_empty(), type_line.is_empty()) {
        (true, _) => type_line,
        (false, true) => name,
        (false, false) => format!("{} {}", name, type_line),
    }
}

fn strip_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("<<") {
        out.push_str(&rest[..start]);
        match rest[start..].find(">>") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
