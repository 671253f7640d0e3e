pub mod db_sqlite;
