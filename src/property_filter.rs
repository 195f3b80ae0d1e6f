use serde::Deserialize;

use crate::property::{OperationKind, PropertyKind, PropertyRecord, PropertyStatus};

/// Public listing filters, as they arrive in the query string.
///
/// Every field is optional; an empty filter keeps every available listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListingFilter {
    pub operation: Option<OperationKind>,
    pub property_type: Option<PropertyKind>,
    pub city: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_bedrooms: Option<u32>,
    pub min_bathrooms: Option<u32>,
    pub featured_only: bool,
    pub status: Option<PropertyStatus>,
    /// Matches title, description or neighborhood.
    pub text: Option<String>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn normalized(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

impl ListingFilter {
    pub fn featured() -> Self {
        Self {
            featured_only: true,
            ..Self::default()
        }
    }

    /// Keeps matching records in their input order.
    pub fn apply<'a>(&self, records: &'a [PropertyRecord]) -> Vec<&'a PropertyRecord> {
        let city = normalized(&self.city);
        let text = normalized(&self.text);

        records
            .iter()
            .filter(|record| {
                let d = &record.draft;
                let status_ok = match self.status {
                    Some(status) => d.status == status,
                    None => d.status == PropertyStatus::Available,
                };
                status_ok
                    && self.operation.map_or(true, |op| d.operation == op)
                    && self.property_type.map_or(true, |kind| d.property_type == kind)
                    && city.as_deref().map_or(true, |c| contains_ci(&d.city, c))
                    && self.min_price.map_or(true, |min| d.price >= min)
                    && self.max_price.map_or(true, |max| d.price <= max)
                    && self.min_bedrooms.map_or(true, |min| d.bedrooms >= min)
                    && self.min_bathrooms.map_or(true, |min| d.bathrooms >= min)
                    && (!self.featured_only || d.featured)
                    && text.as_deref().map_or(true, |t| {
                        contains_ci(&d.title, t)
                            || contains_ci(&d.description, t)
                            || contains_ci(&d.neighborhood, t)
                    })
            })
            .collect()
    }
}
