use std::io::Write;

use assert_cmd::Command;
use predicates as pred;
use tempfile::NamedTempFile;

#[test]
fn end_to_end_outputs_expected_balances() {
    // Account 1 wins g1 (15 vs 3): 1000 - 100 + 180 = 1080.
    // Account 2 loses g1 and gets g2's stake back on expiry: 900.
    // Account 3 withdraws 400 and draws g3: 600.
    let mut file = NamedTempFile::new().expect("create temp file");
    writeln!(
        file,
        "type,account,chat,label,amount,dice\n\
    open,1,,,,\n\
    open,2,,,,\n\
    open,3,,,,\n\
    withdraw,3,,,400,\n\
    create,1,-100,g1,100,\n\
    join,2,,g1,,5 5 5 1 1 1\n\
    create,2,-100,g2,50,\n\
    expire,,,g2,,\n\
    join,3,,g2,,\n\
    create,3,-200,g3,20,\n\
    join,1,,g3,,3 3 3 4 4 1\n\
    bet,1,,,,\n\
    deposit,2,,,1.5,"
    )
    .unwrap();

    let exe = env!("CARGO_BIN_EXE_dice_wager_engine");
    let mut cmd = Command::new(exe);
    cmd.arg(file.path());

    cmd.assert()
        .success()
        .stdout(pred::str::contains("account,balance"))
        .stdout(pred::str::contains("1,1080\n"))
        .stdout(pred::str::contains("2,900\n"))
        .stdout(pred::str::contains("3,600\n"))
        .stdout(pred::str::contains(
            "label,wager,status,creator,joiner,stake,winner,commission",
        ))
        .stdout(pred::str::is_match(r"g1,G[0-9a-f]{32},settled,1,2,100,1,20").unwrap())
        .stdout(pred::str::is_match(r"g2,G[0-9a-f]{32},expired,2,,50,,0").unwrap())
        .stdout(pred::str::is_match(r"g3,G[0-9a-f]{32},settled,3,1,20,,0").unwrap());
}

#[test]
fn config_file_changes_the_rules() {
    let mut config = NamedTempFile::new().expect("create temp file");
    writeln!(config, "starting_balance: 200\nmax_stake: 500\nfee_rate: 0.05").unwrap();

    let mut input = NamedTempFile::new().expect("create temp file");
    writeln!(
        input,
        "type,account,chat,label,amount,dice\n\
    open,1,,,,\n\
    open,2,,,,\n\
    create,1,-7,big,200,\n\
    join,2,,big,,1 1 2 6 6 6"
    )
    .unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dice_wager_engine"));
    cmd.arg(input.path()).arg("--config").arg(config.path());

    // Pot 400, commission floor(400 * 0.05) = 20.
    cmd.assert()
        .success()
        .stdout(pred::str::contains("1,0\n"))
        .stdout(pred::str::contains("2,380\n"));
}

#[test]
fn invalid_config_fails_the_run() {
    let mut config = NamedTempFile::new().expect("create temp file");
    writeln!(config, "fee_rate: 2").unwrap();
    let input = NamedTempFile::new().expect("create temp file");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dice_wager_engine"));
    cmd.arg(input.path()).arg("--config").arg(config.path());

    cmd.assert()
        .failure()
        .stderr(pred::str::contains("FeeRate"));
}
