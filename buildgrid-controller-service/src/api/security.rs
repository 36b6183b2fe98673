use std::str::FromStr;

use buildgrid_common::model::TokenSecret;
use poem::Request;
use poem_openapi::auth::ApiKey;
use poem_openapi::SecurityScheme;

use crate::model::SubmitterAuth;

/// One header per token class; presenting a credential in any other header
/// never authenticates. Validation beyond parsing happens in the auth
/// service, which binds each class to its scope.

#[derive(SecurityScheme)]
#[oai(
    rename = "AdminKey",
    ty = "api_key",
    key_in = "header",
    key_name = "Admin",
    checker = "admin_key_checker"
)]
pub struct AdminSecurity(pub String);

async fn admin_key_checker(_req: &Request, api_key: ApiKey) -> Option<String> {
    let key = api_key.key.trim().to_string();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

#[derive(SecurityScheme)]
#[oai(
    rename = "BuildToken",
    ty = "api_key",
    key_in = "header",
    key_name = "BuildToken",
    checker = "token_secret_checker"
)]
pub struct BuildTokenSecurity(pub TokenSecret);

#[derive(SecurityScheme)]
#[oai(
    rename = "SessionToken",
    ty = "api_key",
    key_in = "header",
    key_name = "SessionToken",
    checker = "token_secret_checker"
)]
pub struct SessionSecurity(pub TokenSecret);

#[derive(SecurityScheme)]
#[oai(
    rename = "BootstrapOTP",
    ty = "api_key",
    key_in = "header",
    key_name = "BootstrapOTP",
    checker = "token_secret_checker"
)]
pub struct BootstrapOtpSecurity(pub TokenSecret);

#[derive(SecurityScheme)]
#[oai(
    rename = "GuestToken",
    ty = "api_key",
    key_in = "header",
    key_name = "GuestToken",
    checker = "token_secret_checker"
)]
pub struct GuestTokenSecurity(pub TokenSecret);

async fn token_secret_checker(_req: &Request, api_key: ApiKey) -> Option<TokenSecret> {
    TokenSecret::from_str(api_key.key.trim()).ok()
}

/// Submitter-facing build routes accept the admin key or the build token
/// bound to the build in the path.
#[derive(SecurityScheme)]
pub enum SubmitterSecurity {
    Admin(AdminSecurity),
    BuildToken(BuildTokenSecurity),
}

impl SubmitterSecurity {
    pub fn to_auth(&self) -> SubmitterAuth {
        match self {
            SubmitterSecurity::Admin(admin) => SubmitterAuth::AdminKey(admin.0.clone()),
            SubmitterSecurity::BuildToken(token) => SubmitterAuth::BuildToken(token.0),
        }
    }
}
