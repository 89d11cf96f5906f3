use secret_vault::certificate_builder::SubjectName;
use secret_vault::error::{Error, RecordKind};
use secret_vault::generate_keypair::generate_keypair;
use secret_vault::key_material::{parse_material, CertType, KeyAlgorithm};
use secret_vault::protocol::{
    CreatePermissionRequest, CreateSecretRequest, CreateTokenRequest, GenerateCertificateRequest,
    GenerateKeyPairRequest, ImportCertificateRequest, VerifyCertificateRequest,
};
use secret_vault::storage::Storage;
use secret_vault::vault::Vault;

const ACTOR: &str = "integration";

fn keypair(vault: &Vault, name: &str, algorithm: &str, key_size: Option<u32>) {
    vault
        .generate_keypair(
            ACTOR,
            &GenerateKeyPairRequest {
                name: name.to_string(),
                algorithm: algorithm.to_string(),
                key_size,
            },
        )
        .unwrap();
}

fn certificate_request(
    name: &str,
    key: &str,
    common_name: &str,
    is_ca: bool,
    signer: Option<&str>,
) -> GenerateCertificateRequest {
    GenerateCertificateRequest {
        name: name.to_string(),
        private_key_name: key.to_string(),
        subject: SubjectName {
            common_name: common_name.to_string(),
            organization: "ACME Corp".to_string(),
            ..Default::default()
        },
        validity_days: 30,
        is_ca,
        dns_names: if is_ca {
            Vec::new()
        } else {
            vec![common_name.to_string()]
        },
        email_addresses: Vec::new(),
        signing_cert_name: signer.map(str::to_string),
    }
}

#[test]
fn test_generated_keys_parse_back_to_requested_size() {
    let cases = [
        ("RSA", Some(2048), KeyAlgorithm::Rsa, 2048),
        ("RSA", Some(4096), KeyAlgorithm::Rsa, 4096),
        ("ECDSA", Some(256), KeyAlgorithm::Ecdsa, 256),
        ("ECDSA", Some(384), KeyAlgorithm::Ecdsa, 384),
        ("ECDSA", Some(521), KeyAlgorithm::Ecdsa, 521),
        ("ED25519", None, KeyAlgorithm::Ed25519, 256),
    ];

    for (name, requested, algorithm, bits) in cases {
        let pair = generate_keypair(name, requested).unwrap();
        for (pem, cert_type) in [
            (&pair.private_pem, CertType::PrivateKey),
            (&pair.public_pem, CertType::PublicKey),
        ] {
            let parsed = parse_material(pem, cert_type).unwrap();
            assert_eq!(parsed.algorithm, algorithm, "{} {:?}", name, cert_type);
            assert_eq!(parsed.key_size, bits, "{} {:?}", name, cert_type);
            assert!(parsed.metadata.is_none());
        }
    }
}

#[test]
fn test_ca_hierarchy_issue_and_verify() {
    let vault = Vault::new(Storage::new().unwrap());

    // The CA key is stored as "<ca cert name>-private" so the CA can sign later
    keypair(&vault, "root", "RSA", Some(2048));
    let root = vault
        .generate_certificate(ACTOR, &certificate_request("root", "root-private", "Root CA", true, None))
        .unwrap();
    assert_eq!(root.cert_type, CertType::CaCertificate);
    assert_eq!(root.algorithm, KeyAlgorithm::Rsa);

    keypair(&vault, "svc", "ECDSA", Some(384));
    let leaf = vault
        .generate_certificate(
            ACTOR,
            &certificate_request("svc-cert", "svc-private", "svc.internal", false, Some("root")),
        )
        .unwrap();
    let metadata = leaf.metadata.clone().unwrap();
    assert_eq!(metadata.issuer, "CN=Root CA,O=ACME Corp");
    assert_eq!(metadata.subject, "CN=svc.internal,O=ACME Corp");
    assert_eq!(metadata.dns_names, vec!["svc.internal".to_string()]);
    assert!(!metadata.is_ca);

    let report = vault
        .verify_certificate(
            ACTOR,
            &VerifyCertificateRequest {
                certificate_name: "svc-cert".to_string(),
                ca_cert_name: Some("root".to_string()),
            },
        )
        .unwrap();
    assert!(report.valid, "{:?}", report.errors);
    assert!(!report.self_signed);
    assert!(report.errors.is_empty());

    // Without the CA a leaf that is not self-signed has nothing to chain to
    let report = vault
        .verify_certificate(
            ACTOR,
            &VerifyCertificateRequest {
                certificate_name: "svc-cert".to_string(),
                ca_cert_name: None,
            },
        )
        .unwrap();
    assert!(!report.valid);
    assert!(!report.self_signed);
    assert!(report.errors.is_empty());
}

#[test]
fn test_signing_requires_stored_ca_key() {
    let vault = Vault::new(Storage::new().unwrap());
    keypair(&vault, "ca", "ED25519", None);
    let ca = vault
        .generate_certificate(ACTOR, &certificate_request("imported-ca", "ca-private", "CA", true, None))
        .unwrap();

    // An imported CA certificate without a matching "-private" record cannot sign
    vault
        .import_certificate(
            ACTOR,
            &ImportCertificateRequest {
                name: "external-ca".to_string(),
                cert_type: "ca_certificate".to_string(),
                pem_data: ca.pem_data.clone(),
            },
        )
        .unwrap();
    keypair(&vault, "leaf", "ED25519", None);
    let err = vault
        .generate_certificate(
            ACTOR,
            &certificate_request("leaf-cert", "leaf-private", "leaf", false, Some("external-ca")),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(RecordKind::CaPrivateKey)));

    let err = vault
        .generate_certificate(
            ACTOR,
            &certificate_request("leaf-cert", "leaf-private", "leaf", false, Some("missing")),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(RecordKind::CaCertificate)));
}

#[test]
fn test_token_patterns_gate_secret_reads() {
    let vault = Vault::new(Storage::new().unwrap());
    for key in ["prod/db/password", "prod/api/key", "staging/db/password"] {
        vault
            .create_secret(
                ACTOR,
                &CreateSecretRequest {
                    key: key.to_string(),
                    value: format!("value of {}", key),
                },
            )
            .unwrap();
    }

    let token = vault
        .create_token(
            ACTOR,
            &CreateTokenRequest {
                token: "deployer".to_string(),
                expires_at: None,
            },
        )
        .unwrap();
    vault
        .create_permission(
            ACTOR,
            &CreatePermissionRequest {
                secret_key_pattern: "*/db/*".to_string(),
                token_id: token.id,
            },
        )
        .unwrap();

    let auth = Some("Api deployer");
    assert!(vault.read_secret(auth, "prod/db/password").is_ok());
    assert!(vault.read_secret(auth, "staging/db/password").is_ok());
    assert!(matches!(
        vault.read_secret(auth, "prod/api/key"),
        Err(Error::Unauthorized(_))
    ));

    let mut readable: Vec<String> = vault
        .list_readable_secrets(auth)
        .unwrap()
        .into_iter()
        .map(|secret| secret.key)
        .collect();
    readable.sort();
    assert_eq!(readable, vec!["prod/db/password", "staging/db/password"]);

    // Revoking the token drops its permissions with it
    vault.delete_token(ACTOR, token.id).unwrap();
    assert!(vault.list_permissions(ACTOR).unwrap().is_empty());
    assert!(matches!(
        vault.read_secret(auth, "prod/db/password"),
        Err(Error::Unauthorized(_))
    ));
}

#[test]
fn test_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");

    {
        let vault = Vault::new(Storage::open(&path).unwrap());
        keypair(&vault, "persisted", "ECDSA", None);
        vault
            .create_secret(
                ACTOR,
                &CreateSecretRequest {
                    key: "app/token".to_string(),
                    value: "abc".to_string(),
                },
            )
            .unwrap();
    }

    let vault = Vault::new(Storage::open(&path).unwrap());
    let names: Vec<String> = vault
        .list_certificates(ACTOR)
        .unwrap()
        .into_iter()
        .map(|summary| summary.name)
        .collect();
    assert!(names.contains(&"persisted-private".to_string()));
    assert!(names.contains(&"persisted-public".to_string()));
    assert_eq!(vault.list_secrets(ACTOR).unwrap().len(), 1);
}
