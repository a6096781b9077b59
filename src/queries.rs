//! GraphQL documents sent through a [`DataSource`](crate::data_source::DataSource).
//!
//! The payloads are opaque to the rest of the crate; only the response fields
//! read by the price cache, historic merger and home info accessors matter.

use std::fmt;

/// Historic data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Consumption,
    Production,
}

impl Direction {
    /// Field holding the energy amount, and the name of the connection in the schema
    pub fn energy_field(self) -> &'static str {
        match self {
            Direction::Consumption => "consumption",
            Direction::Production => "production",
        }
    }

    /// Field holding the money amount for this direction
    pub fn money_field(self) -> &'static str {
        match self {
            Direction::Consumption => "cost",
            Direction::Production => "profit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.energy_field())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Annual,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Hourly => "HOURLY",
            Resolution::Daily => "DAILY",
            Resolution::Weekly => "WEEKLY",
            Resolution::Monthly => "MONTHLY",
            Resolution::Annual => "ANNUAL",
        }
    }
}

const PRICE_FIELDS: &str = "total energy tax startsAt level currency";

pub fn price_info(home_id: &str) -> String {
    format!(
        "{{ viewer {{ home(id: \"{home_id}\") {{ currentSubscription {{ priceInfo {{ \
         current {{ {PRICE_FIELDS} }} today {{ {PRICE_FIELDS} }} tomorrow {{ {PRICE_FIELDS} }} \
         }} }} }} }} }}"
    )
}

pub fn current_price(home_id: &str) -> String {
    format!(
        "{{ viewer {{ home(id: \"{home_id}\") {{ currentSubscription {{ priceInfo {{ \
         current {{ {PRICE_FIELDS} }} }} }} }} }} }}"
    )
}

const INFO_FIELDS: &str = "appNickname features { realTimeConsumptionEnabled } \
     currentSubscription { status priceInfo { current { currency } } } \
     address { address1 address2 address3 city postalCode country latitude longitude } \
     meteringPointData { consumptionEan productionEan gridCompany estimatedAnnualConsumption }";

pub fn update_info(home_id: &str) -> String {
    format!("{{ viewer {{ home(id: \"{home_id}\") {{ {INFO_FIELDS} }} }} }}")
}

/// Home info and full price info in one round trip
pub fn update_info_price(home_id: &str) -> String {
    format!(
        "{{ viewer {{ home(id: \"{home_id}\") {{ appNickname features {{ realTimeConsumptionEnabled }} \
         address {{ address1 country }} meteringPointData {{ productionEan }} \
         currentSubscription {{ status priceInfo {{ \
         current {{ {PRICE_FIELDS} }} today {{ {PRICE_FIELDS} }} tomorrow {{ {PRICE_FIELDS} }} \
         }} }} }} }} }}"
    )
}

/// The last `n` nodes of consumption or production history
pub fn historic_data(home_id: &str, direction: Direction, resolution: Resolution, n: u32) -> String {
    let money = match direction {
        Direction::Consumption => format!("totalCost {}", direction.money_field()),
        Direction::Production => direction.money_field().to_string(),
    };
    format!(
        "{{ viewer {{ home(id: \"{home_id}\") {{ {dir}(resolution: {res}, last: {n}) {{ \
         nodes {{ from to unitPrice unitPriceVAT {dir} {dir}Unit {money} currency }} \
         }} }} }} }}",
        dir = direction.energy_field(),
        res = resolution.as_str(),
    )
}

pub fn historic_price(home_id: &str, resolution: Resolution) -> String {
    format!(
        "{{ viewer {{ home(id: \"{home_id}\") {{ currentSubscription {{ priceRating {{ \
         {res} {{ entries {{ time total energy tax level difference }} }} }} }} }} }} }}",
        res = resolution.as_str().to_lowercase(),
    )
}

pub fn live_subscribe(home_id: &str) -> String {
    format!(
        "subscription {{ liveMeasurement(homeId: \"{home_id}\") {{ \
         timestamp power powerProduction accumulatedConsumption accumulatedProduction \
         accumulatedConsumptionLastHour accumulatedProductionLastHour accumulatedCost \
         minPower averagePower maxPower currentL1 currentL2 currentL3 signalStrength }} }}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historic_query_names_direction_fields() {
        let q = historic_data("abc", Direction::Production, Resolution::Hourly, 5);
        assert!(q.contains("home(id: \"abc\")"));
        assert!(q.contains("production(resolution: HOURLY, last: 5)"));
        assert!(q.contains("profit"));
        assert!(!q.contains("totalCost"));

        let q = historic_data("abc", Direction::Consumption, Resolution::Daily, 720);
        assert!(q.contains("consumption(resolution: DAILY, last: 720)"));
        assert!(q.contains("totalCost cost"));
    }

    #[test]
    fn test_money_field_matches_query() {
        for direction in [Direction::Consumption, Direction::Production] {
            let q = historic_data("abc", direction, Resolution::Hourly, 2);
            assert!(q.contains(&format!(" {} currency", direction.money_field())));
        }
    }

    #[test]
    fn test_price_info_requests_all_sections() {
        let q = price_info("home-1");
        for section in ["current {", "today {", "tomorrow {"] {
            assert!(q.contains(section), "missing {section}");
        }
    }

    #[test]
    fn test_historic_price_uses_lowercase_resolution() {
        assert!(historic_price("h", Resolution::Daily).contains("daily { entries"));
    }
}
