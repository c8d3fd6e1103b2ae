use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use chain_bootstrap::certificate::{
    CertificateConfig, CertificateManager, ProvidedKeyResolver, METADATA_FILE_NAME,
    METADATA_VERSION,
};
use chain_bootstrap::error::{BootstrapError, Result};
use chain_bootstrap::model::{CertificateMetadata, CertificatePair, NodeCertificates};
use chain_bootstrap::runner::{ToolCommand, ToolOutput, ToolRunner};

const MAIN_PRIV: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const MAIN_PUB: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
const TRANSPORT_PRIV: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";
const TRANSPORT_PUB: &str = "DDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDD";

#[derive(Clone, Default)]
struct MockRunner {
    calls: Arc<Mutex<Vec<ToolCommand>>>,
    outputs: Arc<Mutex<VecDeque<ToolOutput>>>,
}

impl MockRunner {
    fn with_outputs(outputs: Vec<ToolOutput>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            outputs: Arc::new(Mutex::new(outputs.into())),
        }
    }

    fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRunner for MockRunner {
    async fn run(&self, cmd: ToolCommand) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(cmd);
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

fn colonize(key: &str) -> String {
    let pairs: Vec<String> = key
        .to_lowercase()
        .as_bytes()
        .chunks(2)
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect();
    pairs
        .chunks(15)
        .map(|line| format!("    {}:", line.join(":")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn stdout(text: String) -> ToolOutput {
    ToolOutput {
        stdout: text,
        stderr: String::new(),
    }
}

fn generation_output() -> ToolOutput {
    stdout(format!(
        "ED25519 Private-Key:\npriv:\n{}\npub:\n{}\nCertificate request self-signature ok\npriv:\n{}\npub:\n{}\nCertificate is to be certified\nCertificate Created\n",
        colonize(MAIN_PRIV),
        colonize(MAIN_PUB),
        colonize(TRANSPORT_PRIV),
        colonize(TRANSPORT_PUB),
    ))
}

fn not_expiring_output() -> ToolOutput {
    stdout(
        "notAfter=Jun  1 12:00:00 2045 GMT\nCertificate will not expire\n".to_string(),
    )
}

fn expiring_output() -> ToolOutput {
    stdout("notAfter=Sep  1 12:00:00 2026 GMT\nCertificate will expire\n".to_string())
}

fn certificates() -> NodeCertificates {
    NodeCertificates {
        main: CertificatePair {
            private_key: MAIN_PRIV.to_string(),
            public_key: MAIN_PUB.to_string(),
        },
        transport: CertificatePair {
            private_key: TRANSPORT_PRIV.to_string(),
            public_key: TRANSPORT_PUB.to_string(),
        },
    }
}

fn config() -> CertificateConfig {
    CertificateConfig {
        server_image: "chainops/server:latest".to_string(),
        ca_certificate_expiration_in_days: 7300,
        node_certificate_expiration_in_days: 375,
        certificate_expiration_warning_in_days: 30,
    }
}

fn manager(runner: MockRunner) -> CertificateManager<MockRunner, ProvidedKeyResolver> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    CertificateManager::new(runner, ProvidedKeyResolver)
}

fn write_current_metadata(folder: &Path) {
    std::fs::create_dir_all(folder).unwrap();
    let metadata = CertificateMetadata {
        version: METADATA_VERSION,
        main_public_key: MAIN_PUB.to_string(),
        transport_public_key: TRANSPORT_PUB.to_string(),
    };
    std::fs::write(
        folder.join(METADATA_FILE_NAME),
        serde_yaml::to_string(&metadata).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn generates_when_metadata_is_absent() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    let runner = MockRunner::with_outputs(vec![generation_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap();

    assert!(generated);
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args, vec!["bash", "create_certificates.sh"]);
    assert!(!calls[0].ignore_errors);
    assert!(calls[0].binds[0].ends_with(":/data:rw"));

    let metadata: CertificateMetadata = serde_yaml::from_str(
        &std::fs::read_to_string(folder.join(METADATA_FILE_NAME)).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata.version, METADATA_VERSION);
    assert_eq!(metadata.main_public_key, MAIN_PUB);
    assert_eq!(metadata.transport_public_key, TRANSPORT_PUB);

    // Generation leaves the inputs the script consumes.
    assert!(folder.join("ca.cnf").exists());
    assert!(folder.join("node.cnf").exists());
    assert!(folder.join("ca.der").exists());
    assert!(folder.join("node.der").exists());
    assert!(folder.join("serial.dat").exists());
    assert!(folder.join("new_certs").is_dir());
}

#[tokio::test]
async fn reuses_valid_unexpired_certificates() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    write_current_metadata(&folder);
    std::fs::write(folder.join("sentinel"), "keep").unwrap();
    let runner = MockRunner::with_outputs(vec![not_expiring_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), true, &folder, None)
        .await
        .unwrap();

    assert!(!generated);
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].ignore_errors);
    assert!(calls[0].args.contains(&"-checkend".to_string()));
    // 30 days in seconds.
    assert!(calls[0].args.contains(&"2592000".to_string()));
    assert!(folder.join("sentinel").exists());
}

#[tokio::test]
async fn expiring_certificates_stay_without_renewal_flag() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    write_current_metadata(&folder);
    let runner = MockRunner::with_outputs(vec![expiring_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap();

    assert!(!generated);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn expiring_certificates_renew_when_requested() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    write_current_metadata(&folder);
    std::fs::write(folder.join("sentinel"), "stale").unwrap();
    let runner = MockRunner::with_outputs(vec![expiring_output(), generation_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), true, &folder, None)
        .await
        .unwrap();

    assert!(generated);
    assert_eq!(runner.calls().len(), 2);
    // The folder was wiped before regeneration.
    assert!(!folder.join("sentinel").exists());
    assert!(folder.join(METADATA_FILE_NAME).exists());
}

#[tokio::test]
async fn version_mismatch_forces_regeneration() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    std::fs::create_dir_all(&folder).unwrap();
    let metadata = CertificateMetadata {
        version: METADATA_VERSION + 1,
        main_public_key: MAIN_PUB.to_string(),
        transport_public_key: TRANSPORT_PUB.to_string(),
    };
    std::fs::write(
        folder.join(METADATA_FILE_NAME),
        serde_yaml::to_string(&metadata).unwrap(),
    )
    .unwrap();
    let runner = MockRunner::with_outputs(vec![generation_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap();

    assert!(generated);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn recorded_key_divergence_forces_regeneration() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    std::fs::create_dir_all(&folder).unwrap();
    let metadata = CertificateMetadata {
        version: METADATA_VERSION,
        main_public_key: TRANSPORT_PUB.to_string(),
        transport_public_key: TRANSPORT_PUB.to_string(),
    };
    std::fs::write(
        folder.join(METADATA_FILE_NAME),
        serde_yaml::to_string(&metadata).unwrap(),
    )
    .unwrap();
    let runner = MockRunner::with_outputs(vec![generation_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap();

    assert!(generated);
}

#[tokio::test]
async fn corrupt_metadata_forces_regeneration() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join(METADATA_FILE_NAME), "{{{{not yaml").unwrap();
    let runner = MockRunner::with_outputs(vec![generation_output()]);

    let generated = manager(runner.clone())
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap();

    assert!(generated);
}

#[tokio::test]
async fn missing_success_marker_is_a_toolchain_error() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    let runner = MockRunner::with_outputs(vec![stdout("unable to load key\n".to_string())]);

    let err = manager(runner)
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::Toolchain(_)));
    // No metadata is recorded for a failed run.
    assert!(!folder.join(METADATA_FILE_NAME).exists());
}

#[tokio::test]
async fn single_key_block_is_a_toolchain_error() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    let output = stdout(format!(
        "priv:\n{}\npub:\n{}\nCertificate Created\n",
        colonize(MAIN_PRIV),
        colonize(MAIN_PUB),
    ));
    let runner = MockRunner::with_outputs(vec![output]);

    let err = manager(runner)
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::Toolchain(_)));
}

#[tokio::test]
async fn diverging_generated_keys_are_a_key_mismatch() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    let other = "EEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE";
    let output = stdout(format!(
        "priv:\n{}\npub:\n{}\nCertificate ok\npriv:\n{}\npub:\n{}\nCertificate Created\n",
        colonize(MAIN_PRIV),
        colonize(other),
        colonize(TRANSPORT_PRIV),
        colonize(TRANSPORT_PUB),
    ));
    let runner = MockRunner::with_outputs(vec![output]);

    let err = manager(runner)
        .ensure_certificate(&config(), "peer-node-0", &certificates(), false, &folder, None)
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::KeyMismatch(_)));
    assert!(!folder.join(METADATA_FILE_NAME).exists());
}

#[tokio::test]
async fn provided_serial_is_normalized_and_written() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    let runner = MockRunner::with_outputs(vec![generation_output()]);

    manager(runner)
        .ensure_certificate(
            &config(),
            "peer-node-0",
            &certificates(),
            false,
            &folder,
            Some("  4FAB12CD  "),
        )
        .await
        .unwrap();

    let serial = std::fs::read_to_string(folder.join("serial.dat")).unwrap();
    assert_eq!(serial, "4fab12cd\n");
}

#[tokio::test]
async fn expiration_probe_without_date_is_a_toolchain_error() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    std::fs::create_dir_all(&folder).unwrap();
    let runner = MockRunner::with_outputs(vec![stdout(
        "Certificate will not expire\n".to_string(),
    )]);

    let err = manager(runner)
        .will_expire("chainops/server:latest", &folder, "node.crt.pem", 30)
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::Toolchain(_)));
}

#[tokio::test]
async fn expiration_probe_without_verdict_is_a_toolchain_error() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    std::fs::create_dir_all(&folder).unwrap();
    let runner = MockRunner::with_outputs(vec![stdout(
        "notAfter=Jun  1 12:00:00 2045 GMT\n".to_string(),
    )]);

    let err = manager(runner)
        .will_expire("chainops/server:latest", &folder, "node.crt.pem", 30)
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::Toolchain(_)));
}

#[tokio::test]
async fn expiration_probe_reads_date_from_stderr_too() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("node-cert");
    std::fs::create_dir_all(&folder).unwrap();
    let runner = MockRunner::with_outputs(vec![ToolOutput {
        stdout: "Certificate will expire\n".to_string(),
        stderr: "notAfter=Sep  1 12:00:00 2026 GMT\n".to_string(),
    }]);

    let report = manager(runner)
        .will_expire("chainops/server:latest", &folder, "node.crt.pem", 30)
        .await
        .unwrap();

    assert!(report.will_expire);
    assert_eq!(report.expiration_date, "Sep  1 12:00:00 2026 GMT");
}
