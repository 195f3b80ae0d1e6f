use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| format!("unknown {} '{}'", stringify!($name), s.trim()))
            }
        }
    };
}

string_enum!(
    /// Sale or rental listing.
    OperationKind {
        Sale => "sale",
        Rental => "rental",
    }
);

string_enum!(PropertyKind {
    House => "house",
    Apartment => "apartment",
    Office => "office",
    Retail => "retail",
    Land => "land",
    Parking => "parking",
});

string_enum!(PropertyStatus {
    Available => "available",
    Sold => "sold",
    Rented => "rented",
    Reserved => "reserved",
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Validated scalar attributes of a listing, ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDraft {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub operation: OperationKind,
    pub property_type: PropertyKind,
    pub bedrooms: u32,
    pub bathrooms: u32,
    pub built_area: Option<f64>,
    pub lot_area: Option<f64>,
    pub address: String,
    pub neighborhood: String,
    pub city: String,
    pub province: String,
    pub country: String,
    pub location: Option<GeoPoint>,
    pub features: Vec<String>,
    pub featured: bool,
    pub status: PropertyStatus,
    pub gated_community: bool,
    pub country_club: bool,
    pub pays_common_charges: bool,
    pub is_studio: bool,
    pub is_covered: bool,
    pub parking_capacity: Option<u32>,
}

/// A listing as stored. `images` is the ordered list of public blob URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub draft: PropertyDraft,
    pub images: Vec<String>,
}

/// Raw form submission. Numbers arrive as text, exactly as the admin typed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyForm {
    pub title: String,
    pub description: String,
    pub price: String,
    pub currency: String,
    pub operation: String,
    pub property_type: String,
    pub bedrooms: String,
    pub bathrooms: String,
    pub built_area: String,
    pub lot_area: String,
    pub address: String,
    pub neighborhood: String,
    pub city: String,
    pub province: String,
    pub country: String,
    pub latitude: String,
    pub longitude: String,
    pub features: Vec<String>,
    pub featured: bool,
    pub status: String,
    pub gated_community: bool,
    pub country_club: bool,
    pub pays_common_charges: bool,
    pub is_studio: bool,
    pub is_covered: bool,
    pub parking_capacity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

struct Checker {
    errors: Vec<FieldError>,
}

impl Checker {
    fn fail(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            message: message.into(),
        });
    }

    fn required(&mut self, field: &'static str, value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.fail(field, "is required");
        }
        trimmed.to_string()
    }

    fn parse_enum<T: FromStr<Err = String>>(&mut self, field: &'static str, value: &str) -> Option<T> {
        if value.trim().is_empty() {
            self.fail(field, "is required");
            return None;
        }
        match value.parse::<T>() {
            Ok(v) => Some(v),
            Err(msg) => {
                self.fail(field, msg);
                None
            }
        }
    }

    fn number(&mut self, field: &'static str, value: &str, min: f64, max: f64) -> Option<f64> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.replace(',', ".").parse::<f64>() {
            Ok(n) if !n.is_finite() => {
                self.fail(field, "must be a finite number");
                None
            }
            Ok(n) if n < min && max == f64::MAX => {
                self.fail(field, format!("must be at least {min}"));
                None
            }
            Ok(n) if n < min || n > max => {
                self.fail(field, format!("must be between {min} and {max}"));
                None
            }
            Ok(n) => Some(n),
            Err(_) => {
                self.fail(field, format!("'{trimmed}' is not a number"));
                None
            }
        }
    }

    fn count(&mut self, field: &'static str, value: &str) -> Option<u32> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<i64>() {
            Ok(n) if n < 0 => {
                self.fail(field, "cannot be negative");
                None
            }
            Ok(n) => match u32::try_from(n) {
                Ok(n) => Some(n),
                Err(_) => {
                    self.fail(field, "is too large");
                    None
                }
            },
            Err(_) => {
                self.fail(field, format!("'{trimmed}' is not a whole number"));
                None
            }
        }
    }
}

impl PropertyForm {
    /// Checks every field and reports all problems at once. No I/O.
    pub fn validate(&self) -> Result<PropertyDraft, Vec<FieldError>> {
        let mut c = Checker { errors: Vec::new() };

        let title = c.required("title", &self.title);
        let address = c.required("address", &self.address);
        let city = c.required("city", &self.city);

        let price = if self.price.trim().is_empty() {
            c.fail("price", "is required");
            None
        } else {
            c.number("price", &self.price, 0.0, f64::MAX)
        };

        let currency = self.currency.trim().to_ascii_uppercase();
        if currency.is_empty() {
            c.fail("currency", "is required");
        } else if currency.len() != 3 || !currency.chars().all(|ch| ch.is_ascii_alphabetic()) {
            c.fail("currency", "must be a three-letter code");
        }

        let operation = c.parse_enum::<OperationKind>("operation", &self.operation);
        let property_type = c.parse_enum::<PropertyKind>("property_type", &self.property_type);
        let status = if self.status.trim().is_empty() {
            Some(PropertyStatus::Available)
        } else {
            c.parse_enum::<PropertyStatus>("status", &self.status)
        };

        let bedrooms = c.count("bedrooms", &self.bedrooms).unwrap_or(0);
        let bathrooms = c.count("bathrooms", &self.bathrooms).unwrap_or(0);
        let parking_capacity = c.count("parking_capacity", &self.parking_capacity);
        let built_area = c.number("built_area", &self.built_area, 0.0, f64::MAX);
        let lot_area = c.number("lot_area", &self.lot_area, 0.0, f64::MAX);

        let latitude = c.number("latitude", &self.latitude, -90.0, 90.0);
        let longitude = c.number("longitude", &self.longitude, -180.0, 180.0);
        let location = match (self.latitude.trim(), self.longitude.trim()) {
            ("", "") => None,
            ("", _) => {
                c.fail("latitude", "is required when longitude is set");
                None
            }
            (_, "") => {
                c.fail("longitude", "is required when latitude is set");
                None
            }
            _ => latitude
                .zip(longitude)
                .map(|(latitude, longitude)| GeoPoint { latitude, longitude }),
        };

        if !c.errors.is_empty() {
            return Err(c.errors);
        }

        // All Options below were checked above.
        let (Some(price), Some(operation), Some(property_type), Some(status)) =
            (price, operation, property_type, status)
        else {
            return Err(vec![FieldError {
                field: "form",
                message: "incomplete".to_string(),
            }]);
        };

        Ok(PropertyDraft {
            title,
            description: self.description.trim().to_string(),
            price,
            currency,
            operation,
            property_type,
            bedrooms,
            bathrooms,
            built_area,
            lot_area,
            address,
            neighborhood: self.neighborhood.trim().to_string(),
            city,
            province: self.province.trim().to_string(),
            country: self.country.trim().to_string(),
            location,
            features: self
                .features
                .iter()
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
            featured: self.featured,
            status,
            gated_community: self.gated_community,
            country_club: self.country_club,
            pays_common_charges: self.pays_common_charges,
            is_studio: self.is_studio,
            is_covered: self.is_covered,
            parking_capacity,
        })
    }
}

impl From<&PropertyDraft> for PropertyForm {
    fn from(draft: &PropertyDraft) -> Self {
        let opt = |v: Option<f64>| v.map(|n| n.to_string()).unwrap_or_default();
        Self {
            title: draft.title.clone(),
            description: draft.description.clone(),
            price: draft.price.to_string(),
            currency: draft.currency.clone(),
            operation: draft.operation.to_string(),
            property_type: draft.property_type.to_string(),
            bedrooms: draft.bedrooms.to_string(),
            bathrooms: draft.bathrooms.to_string(),
            built_area: opt(draft.built_area),
            lot_area: opt(draft.lot_area),
            address: draft.address.clone(),
            neighborhood: draft.neighborhood.clone(),
            city: draft.city.clone(),
            province: draft.province.clone(),
            country: draft.country.clone(),
            latitude: opt(draft.location.map(|p| p.latitude)),
            longitude: opt(draft.location.map(|p| p.longitude)),
            features: draft.features.clone(),
            featured: draft.featured,
            status: draft.status.to_string(),
            gated_community: draft.gated_community,
            country_club: draft.country_club,
            pays_common_charges: draft.pays_common_charges,
            is_studio: draft.is_studio,
            is_covered: draft.is_covered,
            parking_capacity: draft
                .parking_capacity
                .map(|n| n.to_string())
                .unwrap_or_default(),
        }
    }
}
