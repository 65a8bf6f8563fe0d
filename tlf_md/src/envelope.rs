//! Sealing and opening of the signed revision envelope.
//!
//! Private data of private folders is encrypted with the folder key of the
//! revision's key generation; public folders carry it in plain CBOR.

use anyhow::Context;
use std::time::SystemTime;
use tlf_core::crypto::{decrypt, encrypt};
use tlf_core::{
    BareRootMetadata, ImmutableRootMetadata, KeyGen, KeyService, MdId, PrivateMetadata,
    RootMetadata, RootMetadataSigned, Session, SignatureInfo, TlfError, TlfResult,
};

fn is_plaintext(md: &BareRootMetadata) -> bool {
    md.handle.public || md.key_gen == KeyGen::PUBLIC
}

/// Encrypts the private data (unless the writer metadata is copied from an
/// earlier revision), signs the writer metadata and then the envelope.
pub async fn sign_md(
    keys: &dyn KeyService,
    session: &Session,
    rmd: &RootMetadata,
) -> TlfResult<RootMetadataSigned> {
    let mut md = rmd.bare.clone();
    if !md.is_writer_metadata_copied() {
        let plain = minicbor::to_vec(&rmd.data)?;
        md.writer_metadata.serialized_private = if is_plaintext(&md) {
            plain
        } else {
            let key = keys
                .tlf_crypt_key(md.tlf_id(), md.key_gen)
                .await
                .context("while fetching the folder key for signing")?;
            encrypt(key.as_bytes(), &plain)?
        };
        md.writer_sig = Some(SignatureInfo::sign(
            &session.signing_key,
            &md.serialized_writer_metadata()?,
        ));
    }
    seal(session, md)
}

/// Re-signs a revision whose writer metadata was edited after its private
/// data was encrypted, such as when moving it onto a branch.
pub fn resign(session: &Session, mut md: BareRootMetadata) -> TlfResult<RootMetadataSigned> {
    md.writer_sig = Some(SignatureInfo::sign(
        &session.signing_key,
        &md.serialized_writer_metadata()?,
    ));
    seal(session, md)
}

fn seal(session: &Session, md: BareRootMetadata) -> TlfResult<RootMetadataSigned> {
    let sig = SignatureInfo::sign(&session.signing_key, &md.to_vec()?);
    Ok(RootMetadataSigned {
        md,
        sig,
        server_timestamp_ms: 0,
    })
}

/// Recovers the private data of a signed revision.
pub async fn decrypt_private(
    keys: &dyn KeyService,
    md: &BareRootMetadata,
) -> TlfResult<PrivateMetadata> {
    let serialized = &md.writer_metadata.serialized_private;
    let plain = if is_plaintext(md) {
        serialized.clone()
    } else {
        let key = keys
            .tlf_crypt_key(md.tlf_id(), md.key_gen)
            .await
            .context("while fetching the folder key for decryption")?;
        decrypt(key.as_bytes(), serialized).map_err(|e| TlfError::MdMismatch {
            tlf: md.tlf_id(),
            revision: md.revision,
            reason: format!("private data: {e}"),
        })?
    };
    minicbor::decode(&plain).map_err(|e| {
        TlfError::MdMismatch {
            tlf: md.tlf_id(),
            revision: md.revision,
            reason: format!("private data encoding: {e}"),
        }
        .into()
    })
}

/// Opens a revision this device wrote itself and has not yet put to the
/// server: only the self-check runs, no remote key lookups.
pub async fn decrypt_local(
    keys: &dyn KeyService,
    rmds: &RootMetadataSigned,
    md_id: MdId,
    local_timestamp: SystemTime,
) -> TlfResult<ImmutableRootMetadata> {
    rmds.md.is_valid_and_signed(&rmds.sig)?;
    let data = decrypt_private(keys, &rmds.md).await?;
    let writer_key = rmds
        .md
        .writer_sig
        .map_or(rmds.sig.verifying_key, |s| s.verifying_key);
    Ok(ImmutableRootMetadata::new(
        RootMetadata {
            bare: rmds.md.clone(),
            data,
        },
        md_id,
        writer_key,
        local_timestamp,
        false,
    ))
}
