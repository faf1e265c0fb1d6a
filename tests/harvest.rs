mod common;

use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use lexicon_harvest::app::{HarvestOptions, Harvester};
use lexicon_harvest::dataset::load_dataset;
use lexicon_harvest::error::HarvestError;
use lexicon_harvest::output::JsonOutput;

use common::{Lookup, MockAssets, MockListing, recording_sleeper, test_config};

fn asset_of(records: &[lexicon_harvest::domain::Record], id: &str) -> Option<String> {
    records
        .iter()
        .find(|record| record.id.as_str() == id)
        .and_then(|record| record.asset.clone())
}

#[test]
fn two_rows_on_one_key_make_two_records() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "abc");
    let listing =
        MockListing::default().with_page("a", &[("a1", "Alpha1", "D1"), ("a2", "Alpha2", "D2")]);
    let assets = MockAssets::default();
    let harvester = Harvester::new(config.clone(), listing, assets);

    let summary = harvester
        .run(HarvestOptions { skip_assets: true }, &JsonOutput)
        .unwrap();

    assert_eq!(summary.records, 2);
    assert_eq!(summary.keys_ok, 3);
    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].label, "Alpha1");
    assert_eq!(records[1].definition, "D2");
}

#[test]
fn later_keys_win_on_duplicate_ids() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "ab");
    let listing = MockListing::default()
        .with_page("a", &[("x1", "Old", "First"), ("a1", "Alpha1", "D1")])
        .with_page("b", &[("x1", "New", "Second")]);
    let harvester = Harvester::new(config.clone(), listing, MockAssets::default());

    harvester
        .run(HarvestOptions { skip_assets: true }, &JsonOutput)
        .unwrap();

    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(records.len(), 2);
    let x1 = records.iter().find(|r| r.id.as_str() == "x1").unwrap();
    assert_eq!((x1.label.as_str(), x1.definition.as_str()), ("New", "Second"));
}

#[test]
fn failing_key_is_skipped() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "abc");
    let listing = MockListing::default()
        .with_page("a", &[("a1", "Alpha1", "D1")])
        .with_status("b", 502)
        .with_page("c", &[("c1", "Gamma1", "D3")]);
    let harvester = Harvester::new(config.clone(), listing, MockAssets::default());

    let summary = harvester
        .run(HarvestOptions { skip_assets: true }, &JsonOutput)
        .unwrap();

    assert_eq!(summary.keys_failed, vec!["b".to_string()]);
    assert_eq!(summary.records, 2);
}

#[test]
fn downloads_assets_and_leaves_status_failures_unresolved() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    let listing =
        MockListing::default().with_page("a", &[("a1", "Alpha1", "D1"), ("a2", "Alpha2", "D2")]);
    let assets = MockAssets::default()
        .with_lookups("a1", vec![Lookup::Url("alpha1.gif")])
        .with_lookups("a2", vec![Lookup::Status(500)])
        .with_body("alpha1.gif", b"GIF89a-alpha1");
    let (sleeper, delays) = recording_sleeper();
    let harvester = Harvester::new(config.clone(), listing, assets).with_sleeper(sleeper);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].id, "a2");
    assert!(delays.lock().unwrap().is_empty());

    let saved = config.asset_dir.join("alpha1.gif");
    assert_eq!(fs::read(saved.as_std_path()).unwrap(), b"GIF89a-alpha1");

    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(asset_of(&records, "a1").as_deref(), Some("alpha1.gif"));
    assert_eq!(asset_of(&records, "a2"), None);
}

#[test]
fn status_failure_is_never_retried() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    let listing = MockListing::default().with_page("a", &[("a2", "Alpha2", "D2")]);
    let assets = MockAssets::default().with_lookups("a2", vec![Lookup::Status(503)]);
    let (sleeper, _delays) = recording_sleeper();
    let harvester = Harvester::new(config, listing, assets).with_sleeper(sleeper);

    harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    let (_, _, assets) = harvester.into_parts();
    assert_eq!(assets.lookups_for("a2"), 1);
}

#[test]
fn transport_failures_back_off_then_succeed() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    let listing = MockListing::default().with_page("a", &[("a3", "Alpha3", "D3")]);
    let assets = MockAssets::default()
        .with_lookups(
            "a3",
            vec![
                Lookup::Transport,
                Lookup::Transport,
                Lookup::Transport,
                Lookup::Transport,
                Lookup::Url("alpha3.gif"),
            ],
        )
        .with_body("alpha3.gif", b"GIF89a-alpha3");
    let (sleeper, delays) = recording_sleeper();
    let harvester = Harvester::new(config.clone(), listing, assets).with_sleeper(sleeper);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.retried, 1);
    assert_eq!(
        *delays.lock().unwrap(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
        ]
    );
    let (_, _, assets) = harvester.into_parts();
    assert_eq!(assets.lookups_for("a3"), 5);
    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(asset_of(&records, "a3").as_deref(), Some("alpha3.gif"));
}

#[test]
fn retries_are_capped_at_five_attempts() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    let listing = MockListing::default().with_page("a", &[("a4", "Alpha4", "D4")]);
    let assets = MockAssets::default().with_lookups("a4", vec![Lookup::Transport]);
    let (sleeper, delays) = recording_sleeper();
    let harvester = Harvester::new(config.clone(), listing, assets).with_sleeper(sleeper);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].error.contains("5 attempts"));
    let delays = delays.lock().unwrap().clone();
    assert_eq!(delays.len(), 4);
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(16)));
    let (_, _, assets) = harvester.into_parts();
    assert_eq!(assets.lookups_for("a4"), 5);
    assert_eq!(asset_of(&load_dataset(&config.dataset).unwrap(), "a4"), None);
}

#[test]
fn cached_asset_skips_all_network_calls() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    fs::create_dir_all(config.asset_dir.as_std_path()).unwrap();
    fs::write(config.asset_dir.join("alpha1.gif").as_std_path(), b"old bytes").unwrap();
    fs::write(
        config.dataset.as_std_path(),
        "id,label,definition,asset\na1,Alpha1,D1,alpha1.gif\n",
    )
    .unwrap();

    let listing = MockListing::default().with_page("a", &[("a1", "Alpha1", "D1")]);
    let assets = MockAssets::default().with_lookups("a1", vec![Lookup::Url("other.gif")]);
    let harvester = Harvester::new(config.clone(), listing, assets);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.cached, 1);
    let (_, _, assets) = harvester.into_parts();
    assert_eq!(assets.network_calls(), 0);
    assert_eq!(
        fs::read(config.asset_dir.join("alpha1.gif").as_std_path()).unwrap(),
        b"old bytes"
    );
    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(asset_of(&records, "a1").as_deref(), Some("alpha1.gif"));
}

#[test]
fn id_named_file_is_a_cache_hit_without_prior_dataset() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "b");
    fs::create_dir_all(config.asset_dir.as_std_path()).unwrap();
    fs::write(config.asset_dir.join("b1.gif").as_std_path(), b"GIF89a").unwrap();

    let listing = MockListing::default().with_page("b", &[("b1", "Beta1", "D1")]);
    let harvester = Harvester::new(config.clone(), listing, MockAssets::default());

    harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    let (_, _, assets) = harvester.into_parts();
    assert_eq!(assets.network_calls(), 0);
    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(asset_of(&records, "b1").as_deref(), Some("b1.gif"));
}

#[test]
fn referenced_file_on_disk_skips_the_download() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    fs::create_dir_all(config.asset_dir.as_std_path()).unwrap();
    fs::write(config.asset_dir.join("alpha1.gif").as_std_path(), b"GIF89a").unwrap();

    let listing = MockListing::default().with_page("a", &[("a1", "Alpha1", "D1")]);
    let assets = MockAssets::default().with_lookups("a1", vec![Lookup::Url("alpha1.gif")]);
    let harvester = Harvester::new(config.clone(), listing, assets);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.cached, 1);
    let (_, _, assets) = harvester.into_parts();
    assert_eq!(assets.lookups_for("a1"), 1);
    assert!(assets.download_calls.lock().unwrap().is_empty());
}

#[test]
fn undecodable_lookup_and_failed_download_leave_no_asset() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    let listing =
        MockListing::default().with_page("a", &[("a5", "Alpha5", "D5"), ("a6", "Alpha6", "D6")]);
    let assets = MockAssets::default()
        .with_lookups("a5", vec![Lookup::Garbage])
        .with_lookups("a6", vec![Lookup::Url("missing.gif")]);
    let harvester = Harvester::new(config.clone(), listing, assets);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.failed.len(), 2);
    assert!(!config.asset_dir.join("missing.gif").as_std_path().exists());
    let records = load_dataset(&config.dataset).unwrap();
    assert!(records.iter().all(|record| record.asset.is_none()));
}

#[test]
fn every_record_resolves_with_a_single_worker_and_with_unbounded_workers() {
    for workers in [1, 0] {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path(), "a");
        config.workers = workers;
        let rows: Vec<(String, String, String)> = (0..12)
            .map(|n| (format!("w{n}"), format!("Word{n}"), format!("Def{n}")))
            .collect();
        let row_refs: Vec<(&str, &str, &str)> = rows
            .iter()
            .map(|(id, label, def)| (id.as_str(), label.as_str(), def.as_str()))
            .collect();
        let listing = MockListing::default().with_page("a", &row_refs);
        let mut assets = MockAssets::default();
        for n in 0..12 {
            let reference: &'static str = Box::leak(format!("w{n}.gif").into_boxed_str());
            assets = assets
                .with_lookups(&format!("w{n}"), vec![Lookup::Url(reference)])
                .with_body(reference, b"GIF89a");
        }
        let harvester = Harvester::new(config.clone(), listing, assets);

        let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

        assert_eq!(summary.downloaded, 12, "workers={workers}");
        let records = load_dataset(&config.dataset).unwrap();
        for record in &records {
            assert_eq!(record.asset, Some(format!("{}.gif", record.id)));
        }
    }
}

#[test]
fn unwritable_asset_dir_aborts_before_any_request() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path(), "a");
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, b"not a directory").unwrap();
    config.asset_dir = camino::Utf8PathBuf::from_path_buf(blocker.join("gif")).unwrap();

    let listing = MockListing::default().with_page("a", &[("a1", "Alpha1", "D1")]);
    let harvester = Harvester::new(config.clone(), listing, MockAssets::default());

    let result = harvester.run(HarvestOptions::default(), &JsonOutput);

    assert_matches!(result, Err(HarvestError::Setup(_)));
    let (_, listing, _) = harvester.into_parts();
    assert_eq!(listing.call_count(), 0);
    assert!(!config.dataset.as_std_path().exists());
}

#[test]
fn list_only_keeps_asset_names_whose_files_remain() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(temp.path(), "a");
    fs::create_dir_all(config.asset_dir.as_std_path()).unwrap();
    fs::write(config.asset_dir.join("alpha1.gif").as_std_path(), b"GIF89a").unwrap();
    fs::write(
        config.dataset.as_std_path(),
        "id,label,definition,asset\na1,Alpha1,D1,alpha1.gif\na2,Alpha2,D2,gone.gif\n",
    )
    .unwrap();

    let listing =
        MockListing::default().with_page("a", &[("a1", "Alpha1", "New D1"), ("a2", "Alpha2", "D2")]);
    let harvester = Harvester::new(config.clone(), listing, MockAssets::default());

    harvester
        .run(HarvestOptions { skip_assets: true }, &JsonOutput)
        .unwrap();

    let records = load_dataset(&config.dataset).unwrap();
    assert_eq!(asset_of(&records, "a1").as_deref(), Some("alpha1.gif"));
    assert_eq!(asset_of(&records, "a2"), None);
    assert_eq!(records[0].definition, "New D1");
}

#[test]
fn pacing_sleeps_between_keys_and_between_launches() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path(), "abc");
    config.listing_delay = Duration::from_millis(500);
    config.launch_delay = Duration::from_millis(100);
    config.workers = 1;
    let listing = MockListing::default()
        .with_page("a", &[("a1", "Alpha1", "D1"), ("a2", "Alpha2", "D2")])
        .with_status("b", 503)
        .with_page("c", &[("c1", "Gamma1", "D3"), ("c2", "Gamma2", "D4")]);
    let (sleeper, delays) = recording_sleeper();
    let harvester =
        Harvester::new(config, listing, MockAssets::default()).with_sleeper(sleeper);

    let summary = harvester.run(HarvestOptions::default(), &JsonOutput).unwrap();

    assert_eq!(summary.records, 4);
    let listing_pause = Duration::from_millis(500);
    let launch_pause = Duration::from_millis(100);
    assert_eq!(
        *delays.lock().unwrap(),
        vec![listing_pause, listing_pause, launch_pause, launch_pause, launch_pause]
    );
}
