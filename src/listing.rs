//! Listings (annonces): a carrier's transport offer between two cities
use super::error::ValidationError;
use super::identity::UserId;
use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Currency {
    #[n(0)]
    CFA,
    #[n(1)]
    EUR,
    #[n(2)]
    USD,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Price {
    #[n(0)]
    pub amount: u64, // minor units
    #[n(1)]
    pub currency: Currency,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// Ordering delegates to the inner `DateTime`; derived impls would require `T: PartialOrd`.
impl<T: TimeZone + Eq> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn from_nanos(nanos: i64) -> Self {
        Self(DateTime::from_timestamp_nanos(nanos))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, saturating outside the representable range.
    pub fn nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

// Draft of a listing, filled in by the publish / edit forms
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ListingDetails {
    carrier_name: Option<String>,
    origin_city: Option<String>,
    destination_city: Option<String>,
    departure_date: Option<TimeStamp<Utc>>,
    arrival_date: Option<TimeStamp<Utc>>,
    deposit_deadline: Option<TimeStamp<Utc>>,
    pickup_address: Option<String>,
    max_weight_kg: u32,
    price_amount: u64,
    currency: Option<Currency>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Listing {
    #[n(0)]
    pub id: String, // bech32 "annonce_"
    #[n(1)]
    pub owner_id: UserId,
    #[n(2)]
    pub carrier_name: Option<String>,
    #[n(3)]
    pub origin_city: String,
    #[n(4)]
    pub destination_city: String,
    #[n(5)]
    pub departure_date: TimeStamp<Utc>,
    #[n(6)]
    pub arrival_date: TimeStamp<Utc>,
    #[n(7)]
    pub deposit_deadline: TimeStamp<Utc>,
    #[n(8)]
    pub pickup_address: Option<String>,
    #[n(9)]
    pub max_weight_kg: u32,
    #[n(10)]
    pub price: Price,
    #[n(11)]
    pub created_at: TimeStamp<Utc>,
}

impl ListingDetails {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_carrier_name(mut self, name: &str) -> Self {
        self.carrier_name = Some(name.to_string());
        self
    }
    pub fn set_route(mut self, origin: &str, destination: &str) -> Self {
        self.origin_city = Some(origin.trim().to_string());
        self.destination_city = Some(destination.trim().to_string());
        self
    }
    pub fn set_departure_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.departure_date = Some(date);
        self
    }
    pub fn set_arrival_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.arrival_date = Some(date);
        self
    }
    pub fn set_deposit_deadline(mut self, date: TimeStamp<Utc>) -> Self {
        self.deposit_deadline = Some(date);
        self
    }
    pub fn set_pickup_address(mut self, address: &str) -> Self {
        self.pickup_address = Some(address.to_string());
        self
    }
    pub fn set_max_weight_kg(mut self, kg: u32) -> Self {
        self.max_weight_kg = kg;
        self
    }
    pub fn set_price(mut self, amount: u64, currency: Currency) -> Self {
        self.price_amount = amount;
        self.currency = Some(currency);
        self
    }
    /// Checks `deposit deadline <= departure <= arrival`
    pub fn validate_dates(&self) -> bool {
        match (
            self.deposit_deadline.as_ref(),
            self.departure_date.as_ref(),
            self.arrival_date.as_ref(),
        ) {
            (Some(deposit), Some(departure), Some(arrival)) => {
                deposit <= departure && departure <= arrival
            }
            _ => false,
        }
    }
    /// Checks every field and produces the stored record.
    pub fn finalise(self, id: String, owner_id: UserId) -> Result<Listing, ValidationError> {
        let dates_ok = self.validate_dates();
        let origin_city = non_empty(self.origin_city, "Origin city")?;
        let destination_city = non_empty(self.destination_city, "Destination city")?;

        let departure_date = self
            .departure_date
            .ok_or(ValidationError::MissingField("Departure date"))?;
        let arrival_date = self
            .arrival_date
            .ok_or(ValidationError::MissingField("Arrival date"))?;
        let deposit_deadline = self
            .deposit_deadline
            .ok_or(ValidationError::MissingField("Deposit deadline"))?;
        if !dates_ok {
            return Err(ValidationError::InvalidDates);
        }

        if self.max_weight_kg == 0 {
            return Err(ValidationError::NotPositive("Max weight"));
        }
        let currency = self.currency.ok_or(ValidationError::MissingField("Currency"))?;
        if self.price_amount == 0 {
            return Err(ValidationError::NotPositive("Price"));
        }

        Ok(Listing {
            id,
            owner_id,
            carrier_name: self.carrier_name,
            origin_city,
            destination_city,
            departure_date,
            arrival_date,
            deposit_deadline,
            pickup_address: self.pickup_address,
            max_weight_kg: self.max_weight_kg,
            price: Price {
                amount: self.price_amount,
                currency,
            },
            created_at: TimeStamp::new(),
        })
    }
}

pub(crate) fn non_empty(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> TimeStamp<Utc> {
        TimeStamp::new_with(2025, 1, d, 0, 0, 0).unwrap()
    }

    fn paris_dakar() -> ListingDetails {
        ListingDetails::new()
            .set_route("Paris", "Dakar")
            .set_deposit_deadline(day(8))
            .set_departure_date(day(10))
            .set_arrival_date(day(15))
            .set_max_weight_kg(10)
            .set_price(5_000, Currency::EUR)
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn finalise_complete_listing() {
        let listing = paris_dakar()
            .finalise("annonce_1".into(), "user_1".into())
            .unwrap();
        assert_eq!(listing.origin_city, "Paris");
        assert_eq!(listing.price.currency, Currency::EUR);
    }

    #[test]
    fn deposit_after_departure_rejected() {
        let err = paris_dakar()
            .set_deposit_deadline(day(11))
            .finalise("annonce_1".into(), "user_1".into())
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidDates);
    }

    #[test]
    fn blank_city_rejected() {
        let err = paris_dakar()
            .set_route("  ", "Dakar")
            .finalise("annonce_1".into(), "user_1".into())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("Origin city"));
    }

    #[test]
    fn zero_weight_rejected() {
        let err = paris_dakar()
            .set_max_weight_kg(0)
            .finalise("annonce_1".into(), "user_1".into())
            .unwrap_err();
        assert_eq!(err, ValidationError::NotPositive("Max weight"));
    }
}
