pub mod authority;
mod certificate;
mod credentials;
mod trust;

pub use authority::{load_keypair, save_keypair, CertificateAuthority};
pub use certificate::{Certificate, CertificateError};
pub use credentials::RuntimeCredentials;
pub use trust::{TrustError, TrustStore};

/*
 * Identity and trust
 *
 * Every runtime holds an Ed25519 key and a certificate issued by a CA of its
 * domain. The node id is derived from the certificate, so a peer's claimed
 * id can always be checked against the certificate it presents.
 *
 * Key features:
 * - A small CA that issues runtime certificates
 * - A trust store of CA roots
 * - Runtime credentials: sign, verify, and a persistent cache of peers'
 *   certificates
 */
