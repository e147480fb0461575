use std::path::Path;
use std::sync::Arc;

use super::*;

const CATALOG: &str = r#"{
    "nets": {
        "EGI_template.csv": {
            "uni_polar_montages": {
                "L_Insula": [["E030", "E020"], ["E095", "E070"]],
                "reused": [["E030", "E020"], ["E020", "E070"]],
                "three": [["E1", "E2"], ["E3", "E4"], ["E5", "E6"]]
            },
            "multi_polar_montages": {
                "quad": [["E1", "E2"], ["E3", "E4"], ["E5", "E6"], ["E7", "E8"]]
            }
        }
    }
}"#;

const ADHOC: &str = r#"[
    { "name": "flex_hippocampus", "pairs": [[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], [[7.0, 8.0, 9.0], [0.0, 1.0, 2.0]]] }
]"#;

fn catalog() -> MontageCatalog {
    let mut catalog = MontageCatalog::new();
    catalog
        .add_named_json(CATALOG, Path::new("montage_list.json"))
        .unwrap();
    catalog
        .add_adhoc_json(ADHOC, Path::new("flex.json"))
        .unwrap();
    catalog
}

fn names(list: &[&str]) -> CatalogQuery {
    CatalogQuery::Names {
        names: list.iter().map(|s| s.to_string()).collect(),
        eeg_net: "EGI_template.csv".to_string(),
    }
}

#[test]
fn two_pairs_classify_as_ti_and_four_as_mti() {
    let ti = MontageModel::new(
        "ti",
        vec![ElectrodePair::named("a", "b"), ElectrodePair::named("c", "d")],
        Some("net".into()),
    )
    .unwrap();
    assert_eq!(ti.simulation_mode(), SimulationMode::Ti);

    let mti = MontageModel::new(
        "mti",
        vec![
            ElectrodePair::named("a", "b"),
            ElectrodePair::named("c", "d"),
            ElectrodePair::named("e", "f"),
            ElectrodePair::named("g", "h"),
        ],
        Some("net".into()),
    )
    .unwrap();
    assert_eq!(mti.simulation_mode(), SimulationMode::Mti);
    assert_eq!(mti.simulation_mode().pair_count(), mti.pairs().len());
}

#[test]
fn other_pair_counts_are_configuration_errors() {
    for count in [0usize, 1, 3, 5, 6] {
        let pairs = (0..count)
            .map(|i| ElectrodePair::named(format!("a{}", i), format!("b{}", i)))
            .collect();
        let err = MontageModel::new("bad", pairs, Some("net".into())).unwrap_err();
        assert_eq!(err.kind(), "configuration", "count {}", count);
    }
}

#[test]
fn reused_label_is_rejected() {
    let err = MontageModel::new(
        "dup",
        vec![ElectrodePair::named("a", "b"), ElectrodePair::named("b", "c")],
        Some("net".into()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("'b'"));
}

#[test]
fn mixed_electrode_kinds_are_rejected() {
    let err = MontageModel::new(
        "mixed",
        vec![
            ElectrodePair::named("a", "b"),
            ElectrodePair::coordinates([0.0; 3], [1.0; 3]),
        ],
        Some("net".into()),
    )
    .unwrap_err();
    assert_eq!(err.kind(), "configuration");
}

#[test]
fn non_finite_coordinates_are_rejected() {
    let err = MontageModel::new(
        "nan",
        vec![
            ElectrodePair::coordinates([f64::NAN, 0.0, 0.0], [1.0; 3]),
            ElectrodePair::coordinates([2.0; 3], [3.0; 3]),
        ],
        None,
    )
    .unwrap_err();
    assert_eq!(err.kind(), "configuration");
}

#[test]
fn coordinate_montage_drops_net_reference() {
    let m = MontageModel::new(
        "flex",
        vec![
            ElectrodePair::coordinates([0.0; 3], [1.0; 3]),
            ElectrodePair::coordinates([2.0; 3], [3.0; 3]),
        ],
        Some("ignored.csv".into()),
    )
    .unwrap();
    assert!(m.is_coordinate_based());
    assert_eq!(m.eeg_net(), None);
}

#[test]
fn names_with_path_separators_are_rejected() {
    for name in ["", "a/b", "..", "a\\b"] {
        let result = MontageModel::new(
            name,
            vec![ElectrodePair::named("a", "b"), ElectrodePair::named("c", "d")],
            Some("net".into()),
        );
        assert!(result.is_err(), "{:?} should be rejected", name);
    }
}

#[test]
fn catalog_keeps_valid_montages_and_reports_invalid_ones() {
    let load = catalog()
        .load(&names(&["L_Insula", "reused", "three", "quad", "missing"]), false)
        .unwrap();

    let loaded: Vec<&str> = load.montages.iter().map(|m| m.name()).collect();
    assert_eq!(loaded, vec!["L_Insula", "quad"]);

    let rejected: Vec<&str> = load.rejected.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(rejected, vec!["reused", "three", "missing"]);
    assert!(
        load.rejected
            .iter()
            .all(|r| r.error.kind() == "configuration")
    );
}

#[test]
fn strict_load_fails_on_first_invalid_montage() {
    let err = catalog()
        .load(&names(&["L_Insula", "three"]), true)
        .unwrap_err();
    assert!(err.to_string().contains("three"));
}

#[test]
fn duplicate_request_is_rejected_once() {
    let load = catalog()
        .load(&names(&["L_Insula", "L_Insula"]), false)
        .unwrap();
    assert_eq!(load.montages.len(), 1);
    assert_eq!(load.rejected.len(), 1);
}

#[test]
fn name_lookup_falls_back_to_adhoc_entries() {
    let load = catalog()
        .load(&names(&["flex_hippocampus"]), false)
        .unwrap();
    assert_eq!(load.montages.len(), 1);
    assert!(load.montages[0].is_coordinate_based());
}

#[test]
fn name_in_both_sections_keeps_the_multipolar_entry() {
    let content = r#"{
        "nets": {
            "EGI_template.csv": {
                "uni_polar_montages": { "shared": [["E1", "E2"], ["E3", "E4"]] },
                "multi_polar_montages": {
                    "shared": [["E1", "E2"], ["E3", "E4"], ["E5", "E6"], ["E7", "E8"]]
                }
            }
        }
    }"#;
    let mut catalog = MontageCatalog::new();
    catalog
        .add_named_json(content, Path::new("montage_list.json"))
        .unwrap();
    let load = catalog.load(&names(&["shared"]), true).unwrap();
    assert_eq!(load.montages.len(), 1);
    assert_eq!(load.montages[0].simulation_mode(), SimulationMode::Mti);
}

#[test]
fn all_adhoc_query_returns_coordinate_montages() {
    let load = catalog().load(&CatalogQuery::AllAdHoc, true).unwrap();
    assert_eq!(load.montages.len(), 1);
    assert_eq!(load.montages[0].simulation_mode(), SimulationMode::Ti);
}

#[test]
fn labels_are_checked_against_a_loaded_net() {
    let mut catalog = catalog();
    catalog.add_net(ElectrodeNet::parse_csv(
        "EGI_template.csv",
        "Electrode,1.0,2.0,3.0,E030\nElectrode,1.0,2.0,3.0,E020\nElectrode,0,0,0,E095\n",
    ));
    let load = catalog.load(&names(&["L_Insula"]), false).unwrap();
    assert!(load.montages.is_empty());
    assert!(load.rejected[0].error.to_string().contains("E070"));
}

#[test]
fn net_csv_accepts_both_row_layouts() {
    let net = ElectrodeNet::parse_csv(
        "net.csv",
        "label,x,y,z\nFp1,-21.5,70.2,-0.1\nFiducial,0,0,0,Nz\nElectrode,1,2,3,Cz\n\n# comment\n",
    );
    assert_eq!(net.len(), 2);
    assert_eq!(net.position("Fp1"), Some([-21.5, 70.2, -0.1]));
    assert_eq!(net.position("Cz"), Some([1.0, 2.0, 3.0]));
    assert!(!net.contains("Nz"));
}

#[test]
fn overlay_only_holds_coordinate_montages() {
    let catalog = catalog();
    let load = catalog
        .load(&names(&["L_Insula", "flex_hippocampus"]), false)
        .unwrap();
    let overlay = CatalogOverlay::for_montages(&load.montages);
    assert_eq!(overlay.len(), 1);

    let view = CatalogView::new(Arc::new(catalog), overlay);
    assert_eq!(
        view.resolve("L_Insula", Some("EGI_template.csv"))
            .map(|p| p.len()),
        Some(2)
    );
    assert!(view.resolve("unknown", Some("EGI_template.csv")).is_none());
}

#[test]
fn view_resolves_coordinate_montages_through_the_overlay() {
    let load = catalog()
        .load(&names(&["flex_hippocampus"]), false)
        .unwrap();
    let flex = &load.montages[0];
    let view = CatalogView::new(
        Arc::new(MontageCatalog::new()),
        CatalogOverlay::for_montages(&load.montages),
    );
    let pairs = view.resolve(flex.name(), flex.eeg_net()).unwrap();
    assert_eq!(pairs.as_slice(), flex.pairs());
}
