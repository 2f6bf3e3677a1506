use std::io::Cursor;

use retain::{
    read_customers_csv, run_telco_pipeline, TabularConfig, CUSTOMER_ID_COLUMN,
    TELCO_CATEGORICAL_COLUMNS, TELCO_TARGET_COLUMN,
};

const TELCO_CSV: &str = "\
customerID,gender,SeniorCitizen,Partner,Dependents,tenure,PhoneService,MultipleLines,InternetService,OnlineSecurity,OnlineBackup,DeviceProtection,TechSupport,StreamingTV,StreamingMovies,Contract,PaperlessBilling,PaymentMethod,MonthlyCharges,TotalCharges,Churn
7590-VHVEG,Female,0,Yes,No,1,No,No phone service,DSL,No,Yes,No,No,No,No,Month-to-month,Yes,Electronic check,29.85,29.85,No
4472-LVYGI,Female,0,Yes,Yes,0,No,No phone service,DSL,Yes,No,Yes,Yes,Yes,No,Two year,Yes,Bank transfer (automatic),52.55, ,No
7795-CFOCW,Male,0,No,No,45,No,No phone service,DSL,Yes,No,Yes,Yes,No,No,One year,No,Bank transfer (automatic),42.3,1840.75,No
9237-HQITU,Female,1,No,No,2,Yes,No,Fiber optic,No,No,No,No,No,No,Month-to-month,Yes,Electronic check,70.7,151.65,Yes
3668-QPYBK,Male,0,No,No,2,Yes,No,No,No internet service,No internet service,No internet service,No internet service,No internet service,No internet service,Month-to-month,Yes,Mailed check,20.15,40.3,Yes
";

#[test]
fn cleaned_customers_become_one_row_each() {
    let (customers, report) = read_customers_csv(Cursor::new(TELCO_CSV)).unwrap();
    assert_eq!(report.rows_bad_total_charges, 1);

    let output = run_telco_pipeline(&customers, &TabularConfig::default()).unwrap();
    assert_eq!(output.table.len(), customers.len());
    assert_eq!(output.table.id_column, CUSTOMER_ID_COLUMN);
    assert_eq!(output.manifest.target_column, TELCO_TARGET_COLUMN);
    assert_eq!(
        output.table.targets,
        vec![Some(0.0), Some(0.0), Some(1.0), Some(1.0)]
    );
    assert_eq!(output.report.positive_labels, 2);
    assert_eq!(output.report.degraded, 0);
    assert!(output
        .table
        .rows
        .iter()
        .flatten()
        .all(|value| value.is_finite()));
}

#[test]
fn each_categorical_expands_to_one_hot_columns() {
    let (customers, _) = read_customers_csv(Cursor::new(TELCO_CSV)).unwrap();
    let output = run_telco_pipeline(&customers, &TabularConfig::default()).unwrap();

    assert_eq!(output.manifest.categorical_encoded, TELCO_CATEGORICAL_COLUMNS.to_vec());
    for base in TELCO_CATEGORICAL_COLUMNS {
        let prefix = format!("{base}_");
        let encoded: Vec<usize> = output
            .table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| name.starts_with(&prefix))
            .map(|(idx, _)| idx)
            .collect();
        assert!(!encoded.is_empty(), "no encoded columns for {base}");
        assert!(!output.table.columns.iter().any(|name| name == base));

        for row in &output.table.rows {
            let hot: f64 = encoded.iter().map(|idx| row[*idx]).sum();
            assert_eq!(hot, 1.0, "{base}");
        }
    }

    assert!(output.manifest.column_index("contract_type_Month-to-month").is_some());
    assert!(output.manifest.column_index("internet_type_No").is_some());
    assert_eq!(
        output.table.value("3668-QPYBK", "has_online_security"),
        Some(0.0)
    );
}

#[test]
fn reruns_give_identical_tables() {
    let (customers, _) = read_customers_csv(Cursor::new(TELCO_CSV)).unwrap();
    let first = run_telco_pipeline(&customers, &TabularConfig::default()).unwrap();
    let second = run_telco_pipeline(&customers, &TabularConfig::default()).unwrap();
    assert_eq!(first, second);
}

#[cfg(feature = "live-dataset-tests")]
#[test]
fn live_dataset_downloads_and_processes() {
    use retain::{fetch_dataset, DatasetFetchConfig, TELCO_DATASET_URL};

    let body = fetch_dataset(TELCO_DATASET_URL, &DatasetFetchConfig::default()).unwrap();
    let (customers, report) = read_customers_csv(Cursor::new(body)).unwrap();
    assert!(report.rows_read > 7_000);
    assert_eq!(report.rows_bad_total_charges, 11);

    let output = run_telco_pipeline(&customers, &TabularConfig::default()).unwrap();
    assert_eq!(output.table.len(), customers.len());
}
