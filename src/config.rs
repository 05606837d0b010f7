use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    pub pro_monthly_price_id: String,
    pub pro_annual_price_id: String,
    /// product id -> processor price id, parsed from
    /// TOKEN_PRICE_IDS="ai_tokens_20=price_x,export_tokens_10=price_y"
    pub token_price_ids: HashMap<String, String>,
}

impl StripeSettings {
    pub fn price_for_plan(&self, plan: &str) -> Option<&str> {
        match plan {
            "pro_monthly" => Some(self.pro_monthly_price_id.as_str()),
            "pro_annual" => Some(self.pro_annual_price_id.as_str()),
            _ => None,
        }
    }

    pub fn price_for_product(&self, product_id: &str) -> Option<&str> {
        self.token_price_ids.get(product_id).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub stripe: StripeSettings,
    pub jwt_issuer: String,
    pub jwt_audience: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let frontend_origin = env::var("FRONTEND_ORIGIN").expect("FRONTEND_ORIGIN must be set");

        let stripe = StripeSettings {
            secret_key: env::var("STRIPE_SECRET_KEY").expect("STRIPE_SECRET_KEY must be set"),
            webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .expect("STRIPE_WEBHOOK_SECRET must be set"),
            pro_monthly_price_id: env::var("STRIPE_PRO_MONTHLY_PRICE_ID")
                .expect("STRIPE_PRO_MONTHLY_PRICE_ID must be set"),
            pro_annual_price_id: env::var("STRIPE_PRO_ANNUAL_PRICE_ID")
                .expect("STRIPE_PRO_ANNUAL_PRICE_ID must be set"),
            token_price_ids: parse_token_price_ids(
                &env::var("TOKEN_PRICE_IDS").unwrap_or_default(),
            ),
        };

        Config {
            database_url,
            frontend_origin,
            stripe,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "nutrilog".to_string()),
            jwt_audience: env::var("JWT_AUDIENCE").unwrap_or_else(|_| "nutrilog-app".to_string()),
        }
    }
}

fn parse_token_price_ids(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (product, price) = pair.split_once('=')?;
            let product = product.trim();
            let price = price.trim();
            if product.is_empty() || price.is_empty() {
                return None;
            }
            Some((product.to_string(), price.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_price_id_pairs() {
        let map = parse_token_price_ids("ai_tokens_20=price_a, export_tokens_10=price_b");
        assert_eq!(map.get("ai_tokens_20").map(String::as_str), Some("price_a"));
        assert_eq!(
            map.get("export_tokens_10").map(String::as_str),
            Some("price_b")
        );
    }

    #[test]
    fn ignores_malformed_pairs() {
        let map = parse_token_price_ids("no-equals,=price_x,product=,a=b");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a").map(String::as_str), Some("b"));
    }
}
