//! # Seed Data Generator
//!
//! Populates a development store with everything a checkout touches.
//!
//! ## Usage
//! ```bash
//! cargo run -p meridian-db --bin seed
//! cargo run -p meridian-db --bin seed -- --db ./data/meridian.db
//! RUST_LOG=debug cargo run -p meridian-db --bin seed
//! ```
//!
//! ## Generated Data
//! - Retail inventory with barcodes and stock
//! - One active loyalty program (1 point per dollar, 1¢ per point)
//! - Customers with opening point balances
//! - Gift cards with activation entries

use rust_decimal::Decimal;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian_core::{LoyaltyProgram, Money};
use meridian_db::{Database, DbConfig};

/// Retail shelf: (id, name, barcode, price in cents, stock)
const INVENTORY: &[(&str, &str, &str, i64, i64)] = &[
    ("inv-shampoo", "Argan Shampoo 250ml", "5900000000011", 1899, 24),
    ("inv-conditioner", "Argan Conditioner 250ml", "5900000000028", 1899, 18),
    ("inv-serum", "Repair Serum 50ml", "5900000000035", 3200, 6),
    ("inv-brush", "Paddle Brush", "5900000000042", 2450, 10),
    ("inv-spray", "Texture Spray", "5900000000059", 1575, 2),
];

/// (id, name, opening points)
const CUSTOMERS: &[(&str, &str, i64)] = &[
    ("cust-avery", "Avery Quinn", 500),
    ("cust-rowan", "Rowan Ellis", 1250),
    ("cust-sam", "Sam Okafor", 0),
];

/// (card number, balance in cents)
const GIFT_CARDS: &[(&str, i64)] = &[("6000-0000-0001", 7500), ("6000-0000-0002", 2500)];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meridian=debug,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    let mut db_path = "./meridian_dev.db".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Meridian POS Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>    Database file path (default: ./meridian_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(path = %db_path, "Seeding settlement store");

    let db = Database::new(DbConfig::new(&db_path)).await?;

    if db.inventory().count().await? > 0 {
        warn!("Store already has inventory; delete the file to regenerate");
        return Ok(());
    }

    for (id, name, barcode, price_cents, stock) in INVENTORY {
        db.inventory()
            .insert_item(id, name, Some(*barcode), *price_cents, *stock)
            .await?;
    }
    info!(count = INVENTORY.len(), "Inventory seeded");

    db.loyalty()
        .insert_program(&LoyaltyProgram {
            id: "prog-default".to_string(),
            points_per_dollar: Decimal::ONE,
            minimum_points_redeem: 100,
            points_value_cents: 1,
            is_active: true,
        })
        .await?;

    for (id, name, points) in CUSTOMERS {
        db.loyalty().insert_customer(id, name).await?;
        if *points > 0 {
            db.loyalty().append_earn(id, None, *points).await?;
        }
        db.loyalty().refresh_cached_points(id).await?;
    }
    info!(count = CUSTOMERS.len(), "Customers seeded");

    for (number, cents) in GIFT_CARDS {
        let card = db.gift_cards().issue(number, Money::from_cents(*cents)).await?;
        info!(card_id = %card.id, number = %number, balance = %card.cached_balance(), "Gift card issued");
    }

    info!("Seed complete");
    Ok(())
}
