use std::sync::Arc;

use anyhow::Result;
use bookbuddy::{
    config::ClientConfig,
    entity::Username,
    session::{ChatView, HttpChatClient, RenderedConversation},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, PartialEq)]
enum Command {
    Login { username: String, email: String },
    Logout,
    Books,
    Sell { price: f64, title: String, author: String },
    Chat(String),
    Buy(i64),
    Inbox,
    Delete(usize),
    Close,
    Quit,
    Say(String),
}

const HELP: &str = "\
/login <username> <email>       sign in
/logout                         sign out
/books                          list books for sale
/sell <price> <title> | <author> list a book
/buy <book-id>                  chat with a book's seller
/chat <username>                chat with someone directly
/inbox                          your conversations
/delete <line>                  delete one of your messages
/close                          close the open chat
/quit                           exit
anything else is sent to the open chat";

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();

    match name {
        "login" => match args.split_whitespace().collect::<Vec<_>>()[..] {
            [username, email] => Ok(Command::Login {
                username: username.to_string(),
                email: email.to_string(),
            }),
            _ => Err("usage: /login <username> <email>".into()),
        },
        "logout" => Ok(Command::Logout),
        "books" => Ok(Command::Books),
        "sell" => {
            let (price, rest) = args.split_once(' ').ok_or("usage: /sell <price> <title> | <author>")?;
            let price = price.parse::<f64>().map_err(|_| format!("'{}' is not a price", price))?;
            let (title, author) = rest.split_once('|').ok_or("usage: /sell <price> <title> | <author>")?;
            Ok(Command::Sell {
                price,
                title: title.trim().to_string(),
                author: author.trim().to_string(),
            })
        }
        "chat" if !args.is_empty() => Ok(Command::Chat(args.to_string())),
        "buy" => args
            .parse()
            .map(Command::Buy)
            .map_err(|_| "usage: /buy <book-id>".into()),
        "inbox" => Ok(Command::Inbox),
        "delete" => args
            .parse()
            .map(Command::Delete)
            .map_err(|_| "usage: /delete <line>".into()),
        "close" => Ok(Command::Close),
        "quit" | "exit" => Ok(Command::Quit),
        _ => Err(HELP.to_string()),
    }
}

fn print_conversation(rendered: &RenderedConversation) {
    let Some(conversation_id) = &rendered.conversation_id else {
        return;
    };
    println!("--- {} ---", conversation_id);
    if let Some(placeholder) = rendered.placeholder() {
        println!("  {}", placeholder);
    }
    for (i, line) in rendered.lines.iter().enumerate() {
        let marker = if line.mine { "*" } else { " " };
        println!("{} {:>3}. {}", marker, i + 1, line);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = ClientConfig::from_env();
    info!("Connecting to {}", config.server_url);

    let mut client = HttpChatClient::new(&config.server_url)?;
    if let Some(token) = &config.token {
        client = client.with_token(token.clone());
    }
    let client = Arc::new(client);

    let mut view = ChatView::new(client.clone(), client.clone(), config.poll_interval);

    // Reprint the open conversation whenever the poller changes it.
    let mut rendered = view.subscribe();
    tokio::spawn(async move {
        let mut last_shown = RenderedConversation::default();
        while rendered.changed().await.is_ok() {
            let current = rendered.borrow_and_update().clone();
            if current != last_shown {
                print_conversation(&current);
                last_shown = current;
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(usage) => {
                println!("{}", usage);
                continue;
            }
        };

        match command {
            Command::Login { username, email } => match client.login(&username, &email).await {
                Ok(user) => println!("signed in as {}", user),
                Err(e) => println!("login failed: {}", e),
            },
            Command::Logout => {
                view.close();
                client.logout();
                println!("signed out");
            }
            Command::Books => match client.list_listings().await {
                Ok(listings) if listings.is_empty() => println!("no listings yet"),
                Ok(listings) => {
                    for l in listings {
                        println!("#{} {} by {} ({:.2}) sold by {}", l.id, l.title, l.author, l.price, l.seller);
                    }
                }
                Err(e) => println!("could not load books: {}", e),
            },
            Command::Sell { price, title, author } => match client.create_listing(&title, &author, price).await {
                Ok(listing) => println!("listed #{} {}", listing.id, listing.title),
                Err(e) => println!("could not list book: {}", e),
            },
            Command::Chat(partner) => match Username::parse(partner) {
                Ok(partner) => {
                    if let Err(e) = view.open(partner).await {
                        println!("could not open chat: {}", e);
                    }
                }
                Err(e) => println!("{}", e),
            },
            Command::Buy(id) => {
                let listing = match client.list_listings().await {
                    Ok(listings) => listings.into_iter().find(|l| l.id == id),
                    Err(e) => {
                        println!("could not load books: {}", e);
                        continue;
                    }
                };
                match listing {
                    Some(listing) => {
                        if let Err(e) = view.open_listing(&listing).await {
                            println!("could not open chat: {}", e);
                        }
                    }
                    None => println!("book #{} not found", id),
                }
            }
            Command::Inbox => match view.inbox().await {
                Ok(entries) if entries.is_empty() => println!("no conversations yet"),
                Ok(entries) => {
                    for entry in entries {
                        let preview = entry
                            .last_message
                            .map(|m| format!("{}: {}", m.sender, m.text))
                            .unwrap_or_default();
                        println!("{} ({} messages) {}", entry.partner, entry.message_count, preview);
                    }
                }
                Err(e) => println!("could not load inbox: {}", e),
            },
            Command::Delete(n) => {
                let key = view
                    .current()
                    .lines
                    .get(n.wrapping_sub(1))
                    .and_then(|line| line.delete_key);
                match key {
                    Some(key) => {
                        if let Err(e) = view.delete(key).await {
                            println!("could not delete: {}", e);
                        }
                    }
                    None => println!("line {} is not one of your messages", n),
                }
            }
            Command::Close => view.close(),
            Command::Quit => break,
            Command::Say(text) => {
                if let Err(e) = view.send(&text).await {
                    warn!("send failed: {}", e.error);
                    println!("not sent ({}), your message was: {}", e.error, e.input);
                }
            }
        }
    }

    view.close();
    Ok(())
}
