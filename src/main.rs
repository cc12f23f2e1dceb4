#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    mahilo_registry::rocket().launch().await?;
    Ok(())
}
