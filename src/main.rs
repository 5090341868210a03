use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result, Section};
use futures::StreamExt;
use std::path::PathBuf;

use flowto::api::types::{
  Amount, InvoiceFilter, InvoiceList, InvoiceStatus, NewInvoice, Registration, TransactionFilter,
  TransactionList,
};
use flowto::api::{DashboardClient, DEFAULT_PAGE_SIZE};
use flowto::bulk::{BulkJob, BulkStatus, DEFAULT_CATEGORIZE_LIMIT};
use flowto::config::Config;
use flowto::{logging, ApiError, SyncContext};

#[derive(Parser, Debug)]
#[command(name = "flowto")]
#[command(about = "Command-line client for the Flowto accounting dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/flowto/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in (password from FLOWTO_PASSWORD)
  Login {
    #[arg(short, long)]
    email: Option<String>,
  },
  /// Create an account (password from FLOWTO_PASSWORD)
  Register {
    email: String,
    #[arg(long)]
    company: String,
    #[arg(long)]
    name: Option<String>,
  },
  Logout,
  /// Show the signed-in user
  Whoami,
  Invoices {
    #[command(subcommand)]
    command: InvoiceCommand,
  },
  Transactions {
    #[command(subcommand)]
    command: TransactionCommand,
  },
  /// AI-categorize uncategorized transactions in one batch
  CategorizeAll {
    #[arg(long, default_value_t = DEFAULT_CATEGORIZE_LIMIT)]
    limit: u32,
  },
  Reminders {
    #[command(subcommand)]
    command: ReminderCommand,
  },
  Banks {
    #[command(subcommand)]
    command: BankCommand,
  },
  /// Reconciliation and category summaries
  Stats,
}

#[derive(Subcommand, Debug)]
enum InvoiceCommand {
  List {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
    /// pending, paid, overdue or cancelled
    #[arg(long)]
    status: Option<InvoiceStatus>,
    #[arg(long)]
    client: Option<String>,
  },
  Show {
    id: String,
  },
  Create {
    number: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    amount: f64,
    #[arg(long, default_value_t = 0.0)]
    tax: f64,
    #[arg(long, default_value = "EUR")]
    currency: String,
    /// YYYY-MM-DD
    #[arg(long)]
    issued: NaiveDate,
    /// YYYY-MM-DD
    #[arg(long)]
    due: NaiveDate,
    #[arg(long)]
    description: Option<String>,
  },
  Delete {
    id: String,
  },
  /// Download the invoice PDF
  Pdf {
    id: String,
    /// Output file (default: <id>.pdf)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
}

#[derive(Subcommand, Debug)]
enum TransactionCommand {
  List {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    category: Option<String>,
  },
  Show {
    id: String,
  },
  /// AI-categorize one transaction
  Categorize {
    id: String,
  },
}

#[derive(Subcommand, Debug)]
enum ReminderCommand {
  /// Send reminders for all overdue invoices
  ProcessOverdue,
}

#[derive(Subcommand, Debug)]
enum BankCommand {
  List,
  /// Pull new transactions from the bank
  Sync { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let ctx = SyncContext::connect(&config)?;
  run(&ctx.client, &config, args.command)
    .await
    .map_err(|report| {
      let signed_out = report
        .downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_unauthenticated);
      if signed_out {
        report.suggestion("Run `flowto login` to sign in")
      } else {
        report
      }
    })
}

async fn run(client: &DashboardClient, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Login { email } => {
      let email = email
        .or_else(|| config.api.email.clone())
        .ok_or_else(|| eyre!("No email given. Pass --email or set api.email in the config."))?;
      let password = Config::get_password()?;
      client.login(&email, &password).await?;
      println!("Signed in as {}", email);
    }
    Command::Register {
      email,
      company,
      name,
    } => {
      let user = client
        .register(&Registration {
          email,
          password: Config::get_password()?,
          full_name: name,
          company_name: company,
        })
        .await?;
      println!("Registered {} ({}). Run `flowto login` to sign in.", user.email, user.id);
    }
    Command::Logout => {
      client.logout();
      println!("Signed out");
    }
    Command::Whoami => {
      let user = client.me().await?;
      match user.full_name {
        Some(name) => println!("{} <{}>", name, user.email),
        None => println!("{}", user.email),
      }
    }
    Command::Invoices { command } => run_invoices(client, command).await?,
    Command::Transactions { command } => run_transactions(client, command).await?,
    Command::CategorizeAll { limit } => {
      let job = client.categorize_uncategorized(limit);
      let job = follow(client, job).await?;
      println!("Categorized {} transaction(s)", job.succeeded);
    }
    Command::Reminders {
      command: ReminderCommand::ProcessOverdue,
    } => {
      let job = client.process_overdue_reminders();
      let job = follow(client, job).await?;
      println!(
        "{} overdue invoice(s): {} reminder(s) sent, {} failed",
        job.total_candidates, job.succeeded, job.failed
      );
    }
    Command::Banks { command } => match command {
      BankCommand::List => {
        let accounts = client.bank_accounts().await?;
        for account in &accounts.accounts {
          let synced = account
            .last_sync_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
          println!(
            "{:<38} {:<24} {:>12} {}  synced {}",
            account.id, account.bank_name, account.balance, account.currency, synced
          );
        }
        println!("{} account(s)", accounts.total);
      }
      BankCommand::Sync { id } => {
        let result = client.sync_bank_account(&id).await?;
        println!("{} new transaction(s)", result.new_count);
      }
    },
    Command::Stats => {
      let stats = client.reconciliation_stats().await?;
      println!("Reconciliations: {}", stats.total);
      println!(
        "Auto-reconciliation rate: {:.1}%",
        stats.auto_reconciliation_rate * 100.0
      );
      for (method, count) in &stats.by_method {
        println!("  {:<12} {}", method, count);
      }

      let breakdown = client.category_breakdown().await?;
      if !breakdown.is_empty() {
        println!("Spending by category:");
        for (category, amount) in &breakdown {
          println!("  {:<24} {:>12}", category, amount);
        }
      }
    }
  }
  Ok(())
}

async fn run_invoices(client: &DashboardClient, command: InvoiceCommand) -> Result<()> {
  match command {
    InvoiceCommand::List {
      page,
      page_size,
      status,
      client: client_name,
    } => {
      let filter = InvoiceFilter {
        status,
        client_name,
        ..Default::default()
      };
      print_invoices(&client.invoices(page, page_size, &filter).await?);
    }
    InvoiceCommand::Show { id } => {
      let invoice = client.invoice(&id).await?;
      println!("{} ({})", invoice.invoice_number, invoice.status);
      println!("Client:   {}", invoice.client_name);
      println!(
        "Total:    {} {} ({} + {} tax)",
        invoice.total_amount, invoice.currency, invoice.amount, invoice.tax_amount
      );
      println!("Issued:   {}", invoice.issue_date);
      println!("Due:      {}", invoice.due_date);
      if let Some(paid) = invoice.payment_date {
        println!("Paid:     {}", paid);
      }
      println!("Reconciled: {}", if invoice.is_reconciled { "yes" } else { "no" });
    }
    InvoiceCommand::Create {
      number,
      client: client_name,
      amount,
      tax,
      currency,
      issued,
      due,
      description,
    } => {
      if due < issued {
        return Err(eyre!("Due date must be after issue date"));
      }
      let invoice = client
        .create_invoice(&NewInvoice {
          invoice_number: number,
          client_name,
          client_email: None,
          amount: Amount(amount),
          tax_amount: Amount(tax),
          currency,
          issue_date: issued,
          due_date: due,
          description,
        })
        .await?;
      println!("Created {} ({})", invoice.invoice_number, invoice.id);
    }
    InvoiceCommand::Delete { id } => {
      client.delete_invoice(&id).await?;
      println!("Deleted {}", id);
    }
    InvoiceCommand::Pdf { id, output } => {
      let bytes = client.invoice_pdf(&id).await?;
      let path = output.unwrap_or_else(|| PathBuf::from(format!("{}.pdf", id)));
      std::fs::write(&path, &bytes)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("Wrote {} ({} bytes)", path.display(), bytes.len());
    }
  }
  Ok(())
}

async fn run_transactions(client: &DashboardClient, command: TransactionCommand) -> Result<()> {
  match command {
    TransactionCommand::List {
      page,
      page_size,
      search,
      category,
    } => {
      let filter = TransactionFilter {
        search,
        category,
        ..Default::default()
      };
      print_transactions(&client.transactions(page, page_size, &filter).await?);
    }
    TransactionCommand::Show { id } => {
      let tx = client.transaction(&id).await?;
      println!("{}  {}", tx.date.format("%Y-%m-%d"), tx.description);
      println!("Amount:   {} {}", tx.amount, tx.currency);
      println!("Category: {}", tx.category.as_deref().unwrap_or("-"));
      if !tx.is_reconciled {
        let suggestions = client.reconciliation_suggestions(&id).await?;
        for s in &suggestions {
          println!(
            "  match {} ({:.0}%): {}",
            s.invoice_number,
            s.match_score.value() * 100.0,
            s.reasoning
          );
        }
      }
    }
    TransactionCommand::Categorize { id } => {
      let tx = client.categorize_transaction(&id).await?;
      println!(
        "{} -> {}",
        tx.description,
        tx.category.as_deref().unwrap_or("uncategorized")
      );
    }
  }
  Ok(())
}

/// Print progress for a bulk job until it finishes.
async fn follow(client: &DashboardClient, job: BulkJob) -> Result<BulkJob> {
  println!("{} ({})...", job.operation.label(), job.id);

  let updates = client
    .bulk()
    .observe(job.id)
    .ok_or_else(|| eyre!("{} is no longer tracked", job.id))?;
  futures::pin_mut!(updates);

  let mut last = job;
  while let Some(snapshot) = updates.next().await {
    last = snapshot;
  }

  match &last.status {
    BulkStatus::Completed => Ok(last),
    BulkStatus::Failed(e) => Err(eyre!("{} failed: {}", last.operation.label(), e)),
    BulkStatus::Pending | BulkStatus::Running => {
      Err(eyre!("{} ended without a result", last.operation.label()))
    }
  }
}

fn print_invoices(list: &InvoiceList) {
  for invoice in &list.invoices {
    println!(
      "{:<16} {:<28} {:>12} {}  due {}  {}",
      invoice.invoice_number,
      invoice.client_name,
      invoice.total_amount,
      invoice.currency,
      invoice.due_date,
      invoice.status
    );
  }
  println!(
    "page {}/{} ({} invoice(s))",
    list.page,
    list.total_pages.max(1),
    list.total
  );
}

fn print_transactions(list: &TransactionList) {
  for tx in &list.transactions {
    println!(
      "{}  {:<40} {:>12} {}  {}",
      tx.date.format("%Y-%m-%d"),
      tx.description,
      tx.amount,
      tx.currency,
      tx.category.as_deref().unwrap_or("-")
    );
  }
  println!(
    "page {}/{} ({} transaction(s))",
    list.page,
    list.total_pages.max(1),
    list.total
  );
}
