mod metadata_tests;
mod one_way_tests;
mod two_way_tests;
