pub mod product_list_reader;
pub mod purchase_writer;
