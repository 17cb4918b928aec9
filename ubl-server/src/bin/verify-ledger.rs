//! Ledger integrity verifier (§4.H `verify(container_id, from, to)`).
//!
//! Walks one container's chain from sequence 1, recomputing `entry_hash`
//! and checking sequence/tangency at each step, and reports where the
//! chain diverges from what's stored.
//!
//! Usage: `verify-ledger --container <hex container_id> [--from N] [--to N]`

use std::str::FromStr;

use ubl_kernel::Hash;
use ubl_ledger::postgres::PgLedgerStore;

fn arg_after(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let container_arg = arg_after(&args, "--container");

    let Some(container_hex) = container_arg else {
        eprintln!("usage: verify-ledger --container <hex container_id> [--from N] [--to N]");
        std::process::exit(2);
    };

    let container_id = Hash::from_str(&container_hex)?;
    let from: u64 = arg_after(&args, "--from")
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(1);
    let to: u64 = arg_after(&args, "--to")
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(u64::MAX);

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://ubl_dev@localhost:5432/ubl_dev".to_string());

    println!("connecting to {database_url}...");
    let pool = sqlx::PgPool::connect(&database_url).await?;
    let store = PgLedgerStore::new(pool);
    println!("connected\n");

    let result = ubl_server::verify::verify_range(&store, container_id, from, to).await?;

    println!("{}", "=".repeat(72));
    println!("VERIFICATION RESULT: {}", result.container_id);
    println!("{}", "=".repeat(72));

    if result.is_valid() {
        println!(
            "OK — {} entries, all valid",
            result.total_entries
        );
        Ok(())
    } else {
        println!(
            "FAILED — {} entries, {} valid, {} error(s):",
            result.total_entries,
            result.valid_entries,
            result.errors.len()
        );
        for err in result.errors.iter().take(10) {
            println!("  seq {}: {}", err.sequence, err.detail);
        }
        if result.errors.len() > 10 {
            println!("  ... and {} more", result.errors.len() - 10);
        }
        std::process::exit(1);
    }
}
