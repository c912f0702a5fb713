mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

fn fixture() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    common::write_fixture(
        file.path(),
        &[("premium", "inapp"), ("coins", "inapp"), ("gold", "subs")],
        &["premium", "coins", "gas"],
    )
    .unwrap();
    file
}

#[test]
fn test_cli_lists_purchases() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = fixture();
    let mut cmd = Command::new(cargo_bin!("inapps"));
    cmd.arg("--fixture").arg(fixture.path()).arg("purchases");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "type,product_id,order_id,purchase_time,purchase_token,restored",
        ))
        .stdout(predicate::str::contains("inapp,coins,GPA.coins"))
        .stdout(predicate::str::contains("inapp,premium,GPA.premium"))
        .stdout(predicate::str::contains("gold").not());

    Ok(())
}

#[test]
fn test_cli_lists_subscriptions() {
    let fixture = fixture();
    let mut cmd = Command::new(cargo_bin!("inapps"));
    cmd.arg("--fixture")
        .arg(fixture.path())
        .args(["purchases", "--type", "subs"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("subs,gold,GPA.gold"));
}

#[test]
fn test_cli_owned() {
    let fixture = fixture();
    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["owned", "premium"])
        .assert()
        .success()
        .stdout("true\n");

    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["owned", "gas"])
        .assert()
        .success()
        .stdout("false\n");
}

#[test]
fn test_cli_sku_from_file() {
    let fixture = fixture();
    let mut ids = tempfile::NamedTempFile::new().unwrap();
    writeln!(ids, "product_id").unwrap();
    writeln!(ids, "gas").unwrap();
    writeln!(ids, "premium").unwrap();

    let mut cmd = Command::new(cargo_bin!("inapps"));
    cmd.arg("--fixture")
        .arg(fixture.path())
        .args(["sku", "coins", "--from"])
        .arg(ids.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "type,product_id,title,price,currency,price_value",
        ))
        .stdout(predicate::str::contains("inapp,coins,coins,$0.99,USD,0.99"))
        .stdout(predicate::str::contains("inapp,gas,gas,$0.99,USD,0.99"));
}

#[test]
fn test_cli_buy_and_consume() {
    let fixture = fixture();
    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["buy", "gas"])
        .assert()
        .success()
        .stdout(predicate::str::contains("inapp,gas,GPA."))
        .stdout(predicate::str::contains(",false"));

    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["buy", "premium"])
        .assert()
        .success()
        .stdout(predicate::str::contains("inapp,premium,GPA.premium"))
        .stdout(predicate::str::contains(",true"));

    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["consume", "coins"])
        .assert()
        .success()
        .stdout(predicate::str::contains("token-coins"));
}

#[test]
fn test_cli_reports_errors() {
    let fixture = fixture();
    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["consume", "gas"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Purchase for \"gas\" not found"));

    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .args(["buy", "unlisted"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not available for purchase"));
}

#[test]
fn test_cli_config_is_honoured() {
    let fixture = fixture();
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, r#"{{"package_name": "com.other.app", "merchant_id": "1234"}}"#).unwrap();

    Command::new(cargo_bin!("inapps"))
        .arg("--fixture")
        .arg(fixture.path())
        .arg("--config")
        .arg(config.path())
        .args(["owned", "premium"])
        .assert()
        .success()
        .stdout("true\n");

    let mut broken = tempfile::NamedTempFile::new().unwrap();
    writeln!(broken, r#"{{"package_name": ""}}"#).unwrap();
    Command::new(cargo_bin!("inapps"))
        .arg("--config")
        .arg(broken.path())
        .arg("purchases")
        .assert()
        .failure()
        .stderr(predicate::str::contains("package_name must be set"));
}
