use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gallery_storage_core::{CloudDriveOptions, SftpOptions, SmbOptions, Timeouts};

use crate::browser::{DEFAULT_FETCH_CONCURRENCY, PAGE_SIZE};
use crate::context::Settings;

/// Configuration for the gallery-connect tool.
///
/// Multi-value options are comma separated; the n-th entries of each option
/// describe the n-th connection of that backend.
#[derive(Parser, Debug, Clone)]
#[command(name = "gallery-connect")]
#[command(about = "Save generated images to SMB, SFTP and Google Drive, and browse them back")]
pub struct Config {
    /// SMB root directory per connection
    #[arg(long, default_value = "", env = "SMB_PATH")]
    pub smb_path: String,

    /// SMB user:password per connection
    #[arg(long, default_value = "", env = "SMB_USER_PASSWD", hide_env_values = true)]
    pub smb_user_passwd: String,

    /// SMB ip:port per connection
    #[arg(long, default_value = "", env = "SMB_IP_PORT")]
    pub smb_ip_port: String,

    /// SMB server_name:service_name per connection
    #[arg(long, default_value = "", env = "SMB_SERVER_SERVICE")]
    pub smb_server_service: String,

    /// SMB domain/workgroup per connection
    #[arg(long, default_value = "", env = "SMB_DOMAIN")]
    pub smb_domain: String,

    /// SFTP user:password per connection
    #[arg(long, default_value = "", env = "SFTP_USER_PASSWD", hide_env_values = true)]
    pub sftp_user_passwd: String,

    /// SFTP ip:port per connection
    #[arg(long, default_value = "", env = "SFTP_IP_PORT")]
    pub sftp_ip_port: String,

    /// SFTP remote root per connection
    #[arg(long, default_value = "", env = "SFTP_REMOTE_PATH")]
    pub sftp_remote_path: String,

    /// Path to the Google OAuth client secret JSON
    #[arg(long, default_value = "", env = "GDRIVE_CLIENT_SECRET")]
    pub gdrive_client_secret: String,

    /// Name of the Drive folder images are saved into
    #[arg(long, default_value = "", env = "GDRIVE_SAVE_DIR")]
    pub gdrive_save_dir: String,

    /// Where the OAuth token is persisted
    #[arg(long, env = "GDRIVE_CREDENTIALS")]
    pub gdrive_credentials: Option<PathBuf>,

    /// Connect timeout (seconds)
    #[arg(long, default_value = "10", env = "CONNECT_TIMEOUT")]
    pub connect_timeout_secs: u64,

    /// Per-call I/O timeout (seconds)
    #[arg(long, default_value = "30", env = "IO_TIMEOUT")]
    pub io_timeout_secs: u64,

    /// Images per browser page
    #[arg(long, default_value_t = PAGE_SIZE, env = "PAGE_SIZE")]
    pub page_size: usize,

    /// Concurrent downloads while rendering a page (1-8)
    #[arg(long, default_value_t = DEFAULT_FETCH_CONCURRENCY, env = "FETCH_CONCURRENCY")]
    pub fetch_concurrency: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upload an image to every configured backend
    Save {
        /// Local image to upload
        input: PathBuf,

        /// Logical name, e.g. outputs/txt2img-images/00001-1234
        #[arg(long)]
        name: String,

        /// Generation parameters stored under the `parameters` key
        #[arg(long)]
        parameters: Option<String>,
    },

    /// Print one page of a remote gallery directory
    Browse {
        /// Backend kind: smb, sftp or gdrive
        #[arg(long)]
        kind: String,

        /// Which configured connection of that kind
        #[arg(long, default_value = "0")]
        index: usize,

        /// Gallery tab: txt2img, img2img, txt2img-grids, img2img-grids, extras
        #[arg(long, default_value = "txt2img")]
        tab: String,

        /// 1-based page, -1 for the last page
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        page: i64,

        /// Print the parameters of this entry on the page
        #[arg(long)]
        info: Option<usize>,
    },

    /// Run the Google Drive consent step and store the token
    Authorize,
}

impl Config {
    pub fn credentials_path(&self) -> PathBuf {
        self.gdrive_credentials.clone().unwrap_or_else(default_credentials_path)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            io: Duration::from_secs(self.io_timeout_secs),
        }
    }

    pub fn smb_options(&self) -> SmbOptions {
        SmbOptions {
            path: self.smb_path.clone(),
            user_passwd: self.smb_user_passwd.clone(),
            ip_port: self.smb_ip_port.clone(),
            server_service: self.smb_server_service.clone(),
            domain: self.smb_domain.clone(),
        }
    }

    pub fn sftp_options(&self) -> SftpOptions {
        SftpOptions {
            user_passwd: self.sftp_user_passwd.clone(),
            ip_port: self.sftp_ip_port.clone(),
            remote_path: self.sftp_remote_path.clone(),
        }
    }

    pub fn cloud_drive_options(&self) -> CloudDriveOptions {
        CloudDriveOptions {
            client_secret: self.gdrive_client_secret.clone(),
            save_dir: self.gdrive_save_dir.clone(),
            credentials_path: self.credentials_path(),
        }
    }

    /// Parse every backend's options into settings.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::from_options(
            &self.smb_options(),
            &self.sftp_options(),
            &self.cloud_drive_options(),
        );
        settings.timeouts = self.timeouts();
        settings.page_size = self.page_size.max(1);
        settings.fetch_concurrency = self.fetch_concurrency;
        settings
    }
}

/// `<config dir>/gallery-connect/gdrive-token.json`
pub fn default_credentials_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gallery-connect")
        .join("gdrive-token.json")
}
