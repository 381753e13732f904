//! Menu client demo.
//!
//! Prints the menu, optionally adds a dish, then reprints whenever the server
//! asks for a refresh.

mod protocol;

use clap::Parser;
use hatch_client::{Envelope, MessageKind, Session, SessionConfig};
use protocol::Dish;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Watch the shared menu")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "HATCH_PORT", default_value_t = 8001)]
    port: u16,
    /// Name of a dish to add.
    #[arg(long)]
    add: Option<String>,
    #[arg(long, default_value_t = 0)]
    price: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hatch=info".parse()?))
        .init();

    let args = Args::parse();
    let session = Session::connect(SessionConfig::new(args.host, args.port)).await?;
    let refresh = session.refresh();

    print_menu(&session).await?;

    if let Some(name) = args.add {
        let dish = Dish {
            name,
            description: String::new(),
            price: args.price,
        };
        session
            .send(&Envelope::with_payload(MessageKind::AddDish, &dish)?)
            .await?;
    }

    loop {
        tokio::select! {
            _ = refresh.wait() => print_menu(&session).await?,
            reason = session.closed() => {
                // Reconnecting is a policy decision; this demo just stops.
                anyhow::bail!("server went away: {reason}");
            }
        }
    }
}

async fn print_menu(session: &Session) -> anyhow::Result<()> {
    let reply = session.request(&Envelope::new(MessageKind::GetDishes)).await?;
    let dishes: Vec<Dish> = reply.payload_as()?;
    println!("--- menu ({} dishes) ---", dishes.len());
    for dish in dishes {
        println!("{:<24} {:>4}.{:02}", dish.name, dish.price / 100, dish.price % 100);
    }
    Ok(())
}
