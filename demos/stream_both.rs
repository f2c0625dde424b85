use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;
use userstream_sdk::stream::client::{Connector, UserServiceClient};
use userstream_sdk::stream::proto::{Method, ServerMessage, User, UserStatus};
use userstream_sdk::stream::transport::{channel_pair, ChannelTransport, Transport, TransportError};

/// Serves every call from a task in this process.
struct LocalUserService;

#[async_trait]
impl Connector for LocalUserService {
    type Transport = ChannelTransport<User, ServerMessage>;

    async fn connect(&self, method: Method) -> Result<Self::Transport, TransportError> {
        let (client, server) = channel_pair::<User, ServerMessage>(8);
        tokio::spawn(async move {
            if let Err(err) = serve(method, &server).await {
                eprintln!("service error on {method}: {err}");
            }
            let _ = server.close_send().await;
        });
        Ok(client)
    }
}

async fn serve(
    method: Method,
    server: &ChannelTransport<ServerMessage, User>,
) -> Result<(), TransportError> {
    match method {
        Method::AddUser => {
            if let Some(user) = server.receive_message().await? {
                server.send_message(ServerMessage::User { user }).await?;
            }
        }
        Method::AddUserVerbose => {
            if let Some(user) = server.receive_message().await? {
                for status in [
                    UserStatus::Init,
                    UserStatus::Inserting,
                    UserStatus::UserHasBeenInserted,
                    UserStatus::Completed,
                ] {
                    let user = Some(user.clone());
                    server.send_message(ServerMessage::Status { status, user }).await?;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        }
        Method::AddUsers => {
            let mut users = Vec::new();
            while let Some(user) = server.receive_message().await? {
                users.push(user);
            }
            server.send_message(ServerMessage::Users { users }).await?;
        }
        Method::AddUserStreamBoth => {
            while let Some(user) = server.receive_message().await? {
                let status = UserStatus::Completed;
                let user = Some(user);
                server.send_message(ServerMessage::Status { status, user }).await?;
            }
        }
    }
    Ok(())
}

fn sample_users() -> Vec<User> {
    (1..=5)
        .map(|n| {
            User::new(
                format!("r{n}"),
                format!("Raphael {n}"),
                format!("rpl{n}@rpl.com"),
            )
        })
        .collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = UserServiceClient::new(LocalUserService)
            .with_send_interval(Duration::from_millis(500));

        let user = client.add_user(User::new("0", "Joao", "j@j.com")).await?;
        println!("add_user: {user:?}");

        client
            .add_user_verbose(User::new("0", "Joao", "j@j.com"), |status, _| {
                println!("add_user_verbose status: {status}");
            })
            .await?;

        let users = client.add_users(sample_users()).await?;
        println!("add_users stored {} users", users.len());

        let summary = client
            .add_user_stream_both(sample_users(), |status, user| {
                let name = user.map(|user| user.name).unwrap_or_default();
                println!("receiving user {name} with status: {status}");
            })
            .await?;
        println!(
            "add_user_stream_both sent={} received={}",
            summary.sent, summary.received
        );

        Ok::<(), Box<dyn Error>>(())
    })
}
