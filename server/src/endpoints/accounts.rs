// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Account surface consumed by the delivery core: PoW challenge, signup and
//! credential refresh, and the push token registration endpoints that feed
//! the per-group push snapshots.

use actix_web::{HttpResponse, web};
use emberbackend::account::{
    Account, AccountState, AccountStoreError, ClientVersion, Device, ModifyAccount,
};
use embercommon::{
    MASTER_DEVICE_ID,
    auth::AuthCredential,
    crypto::signature::verify_signature,
    identifiers::Uid,
    pow,
    time::now_millis,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{auth::MasterDevice, metrics_marker::ExecMarker, services::AppServices};

const ACCOUNT_SERVICE: &str = "accounts";

#[derive(Debug, Serialize)]
struct ApiError {
    error: &'static str,
}

fn error_body(error: &'static str) -> ApiError {
    ApiError { error }
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub nonce: u32,
    pub difficulty: u32,
}

/// `GET /v1/accounts/challenge/{uid}`
pub async fn challenge(
    services: web::Data<AppServices>,
    path: web::Path<String>,
) -> HttpResponse {
    let _marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "challenge");
    let uid = Uid::new(path.into_inner());
    let challenge = services
        .challenges
        .issue(&uid, services.settings.accounts.challenge_difficulty);
    HttpResponse::Ok().json(ChallengeResponse {
        nonce: challenge.nonce,
        difficulty: challenge.difficulty,
    })
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Base64 account public key; the uid is derived from it.
    pub public_key: String,
    /// PoW counter solving the previously issued challenge.
    pub client_nonce: u32,
    /// Fresh device token to store.
    pub token: String,
    /// Signature over the token, proving key possession.
    pub sig: String,
}

/// `PUT /v1/accounts/signup`
pub async fn signup(
    services: web::Data<AppServices>,
    body: web::Json<SignupRequest>,
) -> HttpResponse {
    let mut marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "signup");
    let req = body.into_inner();

    let Ok(public_key) = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        &req.public_key,
    ) else {
        marker.set_return_code(400);
        return HttpResponse::BadRequest().json(error_body("malformed public key"));
    };
    let uid = Uid::from_public_key(&public_key);

    let Some(challenge) = services.challenges.take(&uid) else {
        marker.set_return_code(412);
        return HttpResponse::PreconditionFailed().json(error_body("no pending challenge"));
    };
    if challenge.is_expired(services.settings.accounts.challenge_ttl_secs) {
        marker.set_return_code(409);
        return HttpResponse::Conflict().json(error_body("challenge expired"));
    }
    if !pow::verify_counter(
        uid.as_str(),
        challenge.nonce,
        challenge.difficulty,
        req.client_nonce,
    ) {
        marker.set_return_code(400);
        return HttpResponse::BadRequest().json(error_body("invalid proof of work"));
    }
    if !verify_signature(&req.public_key, req.token.as_bytes(), &req.sig) {
        marker.set_return_code(401);
        return HttpResponse::Unauthorized().json(error_body("bad signature"));
    }

    let device = Device::new(MASTER_DEVICE_ID, AuthCredential::derive(&req.token));
    let account = Account {
        uid: uid.clone(),
        public_key: req.public_key,
        state: AccountState::Normal,
        devices: vec![device],
    };
    match services.accounts.create_account(account).await {
        Ok(()) => {
            info!(%uid, "account created");
            HttpResponse::Ok().json(serde_json::json!({ "uid": uid }))
        }
        Err(AccountStoreError::AlreadyExists) => {
            marker.set_return_code(409);
            HttpResponse::Conflict().json(error_body("account exists"))
        }
        Err(e) => {
            warn!(%uid, error = %e, "signup store error");
            marker.set_return_code(500);
            HttpResponse::InternalServerError().json(error_body("store error"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SigninRequest {
    pub uid: String,
    /// Replacement device token.
    pub token: String,
    /// Signature over the token with the account key.
    pub sig: String,
}

/// `PUT /v1/accounts/signin`: refresh the master device credentials.
pub async fn signin(
    services: web::Data<AppServices>,
    body: web::Json<SigninRequest>,
) -> HttpResponse {
    let mut marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "signin");
    let req = body.into_inner();
    let uid = Uid::new(req.uid);

    let account = match services.accounts.get_account(&uid).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            marker.set_return_code(404);
            return HttpResponse::NotFound().json(error_body("unknown account"));
        }
        Err(e) => {
            warn!(%uid, error = %e, "signin store error");
            marker.set_return_code(500);
            return HttpResponse::InternalServerError().json(error_body("store error"));
        }
    };
    if !verify_signature(&account.public_key, req.token.as_bytes(), &req.sig) {
        marker.set_return_code(401);
        return HttpResponse::Unauthorized().json(error_body("bad signature"));
    }

    let modify = ModifyAccount::new(uid.clone()).push(
        emberbackend::account::AccountMutation::SetDeviceAuth {
            device_id: MASTER_DEVICE_ID,
            auth: AuthCredential::derive(&req.token),
        },
    );
    match services.accounts.apply(modify).await {
        Ok(_) => {
            info!(%uid, "credentials refreshed");
            HttpResponse::Ok().finish()
        }
        Err(e) => {
            warn!(%uid, error = %e, "signin apply error");
            marker.set_return_code(500);
            HttpResponse::InternalServerError().json(error_body("store error"))
        }
    }
}

/// `DELETE /v1/accounts/{uid}/{signature}`: destroy the account. The
/// signature is over the uid with the account key.
pub async fn destroy(
    services: web::Data<AppServices>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let mut marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "destroy");
    let (uid, signature) = path.into_inner();
    let uid = Uid::new(uid);

    let account = match services.accounts.get_account(&uid).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            marker.set_return_code(404);
            return HttpResponse::NotFound().json(error_body("unknown account"));
        }
        Err(_) => {
            marker.set_return_code(500);
            return HttpResponse::InternalServerError().json(error_body("store error"));
        }
    };
    if !verify_signature(&account.public_key, uid.as_str().as_bytes(), &signature) {
        marker.set_return_code(401);
        return HttpResponse::Unauthorized().json(error_body("bad signature"));
    }

    if services.accounts.delete_account(&uid).await.is_err() {
        marker.set_return_code(500);
        return HttpResponse::InternalServerError().json(error_body("store error"));
    }
    // force every connected session of the account off
    for device in &account.devices {
        services
            .dispatch
            .kick(&embercommon::identifiers::DispatchAddress::new(
                uid.clone(),
                device.id,
            ));
    }
    info!(%uid, "account destroyed");
    HttpResponse::Ok().finish()
}

#[derive(Debug, Deserialize)]
pub struct AttributesRequest {
    #[serde(default)]
    pub os_type: u32,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub build_code: u64,
    #[serde(default)]
    pub phone_model: String,
}

/// `PUT /v1/accounts/attributes`
pub async fn update_attributes(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    body: web::Json<AttributesRequest>,
) -> HttpResponse {
    let mut marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "attributes");
    let req = body.into_inner();
    let uid = auth.0.account.uid.clone();
    let modify = ModifyAccount::new(uid.clone())
        .push(emberbackend::account::AccountMutation::SetClientVersion {
            device_id: auth.0.device.id,
            version: ClientVersion {
                os_type: req.os_type,
                os_version: req.os_version,
                build_code: req.build_code,
                phone_model: req.phone_model,
            },
        })
        .touch(auth.0.device.id, now_millis());
    match services.accounts.apply(modify).await {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(e) => {
            warn!(%uid, error = %e, "attributes apply error");
            marker.set_return_code(500);
            HttpResponse::InternalServerError().json(error_body("store error"))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApnRegistration {
    #[serde(default)]
    pub apn_id: String,
    #[serde(default)]
    pub apn_type: String,
    #[serde(default)]
    pub voip_apn_id: String,
}

/// `PUT /v1/accounts/apn` and `DELETE /v1/accounts/apn` (blank
/// registration). After the store update the per-group snapshots are
/// rewritten so offline pushes use the new registration immediately.
pub async fn register_apn(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    body: web::Json<ApnRegistration>,
) -> HttpResponse {
    apply_apn(services, auth, body.into_inner()).await
}

pub async fn unregister_apn(services: web::Data<AppServices>, auth: MasterDevice) -> HttpResponse {
    apply_apn(services, auth, ApnRegistration::default()).await
}

async fn apply_apn(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    registration: ApnRegistration,
) -> HttpResponse {
    let mut marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "apn");
    let uid = auth.0.account.uid.clone();
    let modify = ModifyAccount::new(uid.clone()).set_apn_registration(
        auth.0.device.id,
        registration.apn_id,
        registration.apn_type,
        registration.voip_apn_id,
    );
    finish_registration(services, auth, modify, &mut marker).await
}

#[derive(Debug, Default, Deserialize)]
pub struct GcmRegistration {
    #[serde(default)]
    pub gcm_id: String,
    #[serde(default)]
    pub umeng_id: String,
}

/// `PUT /v1/accounts/gcm` and `DELETE /v1/accounts/gcm`.
pub async fn register_gcm(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    body: web::Json<GcmRegistration>,
) -> HttpResponse {
    apply_gcm(services, auth, body.into_inner()).await
}

pub async fn unregister_gcm(services: web::Data<AppServices>, auth: MasterDevice) -> HttpResponse {
    apply_gcm(services, auth, GcmRegistration::default()).await
}

async fn apply_gcm(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    registration: GcmRegistration,
) -> HttpResponse {
    let mut marker = ExecMarker::new(services.metrics.clone(), ACCOUNT_SERVICE, "gcm");
    let uid = auth.0.account.uid.clone();
    let modify = ModifyAccount::new(uid.clone()).set_gcm_registration(
        auth.0.device.id,
        registration.gcm_id,
        registration.umeng_id,
    );
    finish_registration(services, auth, modify, &mut marker).await
}

async fn finish_registration(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    modify: ModifyAccount,
    marker: &mut ExecMarker,
) -> HttpResponse {
    match services.accounts.apply(modify).await {
        Ok(updated) => {
            if let Some(device) = updated.device(auth.0.device.id) {
                services
                    .group_service
                    .refresh_push_snapshot(&updated, device)
                    .await;
            }
            HttpResponse::Ok().finish()
        }
        Err(e) => {
            warn!(uid = %auth.0.account.uid, error = %e, "registration apply error");
            marker.set_return_code(500);
            HttpResponse::InternalServerError().json(error_body("store error"))
        }
    }
}
